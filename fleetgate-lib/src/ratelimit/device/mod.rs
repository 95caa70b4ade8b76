#![allow(clippy::module_inception)]

mod device;
mod key;
mod pacing;
mod permit;
mod stats;

pub use device::Device;
pub use key::DeviceKey;
pub use permit::DevicePermit;
pub use stats::{DeviceStats, DeviceStatsMap};
