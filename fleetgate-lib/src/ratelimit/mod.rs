//! Per-device admission control.
//!
//! Every request to a device has to be admitted before it is sent. Admission
//! enforces, in this order:
//!
//! 1. the device's circuit breaker, which rejects without waiting while the
//!    device is known to be unreachable
//! 2. a global concurrency limit shared by all devices
//! 3. a per-device concurrency limit chosen by the device's [`crate::Generation`]
//! 4. a minimum interval between two requests to the same device
//!
//! # Architecture
//!
//! - [`DeviceKey`]: Normalized address identifying a device
//! - [`Device`]: Gate, pacer and circuit breaker of a single device
//! - [`RateLimiter`]: Registry of devices and owner of the global gate
//! - [`DevicePermit`]: RAII proof of admission, released on drop
//! - [`CircuitBreaker`]: Closed/Open/HalfOpen failure isolation
//! - [`Config`]: Limits per generation and circuit breaker timing
//! - [`DeviceStats`]: Read-only snapshot of a device

mod circuit;
mod config;
mod device;
mod error;
mod limiter;

pub use circuit::{CircuitBreaker, CircuitPass, CircuitState, CircuitStats};
pub use config::{Config, GenerationConfig};
pub use device::{Device, DeviceKey, DevicePermit, DeviceStats, DeviceStatsMap};
pub use error::{ConfigError, ExecuteError, RateLimitError};
pub use limiter::RateLimiter;
