mod device_error;
mod generation;

pub use device_error::DeviceError;
pub use generation::Generation;
