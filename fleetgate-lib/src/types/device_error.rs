use thiserror::Error;

/// Errors reported by the device transport.
///
/// These are the sentinels the transport layer uses to describe how a request
/// to a device went wrong. Only [`DeviceError::Offline`] and
/// [`DeviceError::Timeout`] mean the device could not be reached; all other
/// variants describe a device that answered, just not usefully. See
/// [`crate::is_connectivity_failure`].
#[derive(Error, Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DeviceError {
    /// The requested resource (component, channel, endpoint) does not exist
    #[error("Resource not found on device")]
    NotFound,
    /// The device does not implement the requested operation
    #[error("Operation not supported by device")]
    NotSupported,
    /// The device rejected our credentials
    #[error("Authentication with device failed")]
    Auth,
    /// The device rejected a request parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// The device answered with something we could not interpret
    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),
    /// The device did not answer at all
    #[error("Device is offline")]
    Offline,
    /// The device did not answer in time
    #[error("Request to device timed out")]
    Timeout,
}

impl DeviceError {
    /// Whether this error means the device was unreachable
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Offline | Self::Timeout)
    }
}
