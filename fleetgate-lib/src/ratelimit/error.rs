use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::DeviceKey;

/// Errors that can occur while waiting for admission to a device
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RateLimitError {
    /// The device's circuit breaker is open, no capacity was consumed
    #[error("Device {device} is unresponsive (circuit open), try again later")]
    CircuitOpen {
        /// The device that was rejected
        device: DeviceKey,
    },

    /// The caller cancelled the admission while it was waiting
    #[error("Admission to device {device} was cancelled")]
    Cancelled {
        /// The device the caller was waiting for
        device: DeviceKey,
    },

    /// The admission did not complete before the caller's deadline
    #[error("Admission to device {device} exceeded deadline of {}ms", timeout.as_millis())]
    DeadlineExceeded {
        /// The device the caller was waiting for
        device: DeviceKey,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// Non-blocking admission found no free global slot
    #[error("Global concurrency limit reached")]
    GlobalCapacityExhausted,

    /// Non-blocking admission found no free slot for the device
    #[error("Concurrency limit reached for device {device}")]
    DeviceCapacityExhausted {
        /// The saturated device
        device: DeviceKey,
    },

    /// Non-blocking admission came too soon after the previous one
    #[error("Device {device} may not be contacted for another {}ms", retry_after.as_millis())]
    IntervalPending {
        /// The paced device
        device: DeviceKey,
        /// Time left until the pacing interval has elapsed
        retry_after: Duration,
    },
}

impl RateLimitError {
    /// Whether a non-blocking admission was refused only because it would
    /// have had to wait
    #[must_use]
    pub const fn would_block(&self) -> bool {
        matches!(
            self,
            Self::GlobalCapacityExhausted
                | Self::DeviceCapacityExhausted { .. }
                | Self::IntervalPending { .. }
        )
    }

    /// Whether the device's circuit breaker refused the admission
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// The device this error refers to, if any
    #[must_use]
    pub const fn device(&self) -> Option<&DeviceKey> {
        match self {
            Self::CircuitOpen { device }
            | Self::Cancelled { device }
            | Self::DeadlineExceeded { device, .. }
            | Self::DeviceCapacityExhausted { device }
            | Self::IntervalPending { device, .. } => Some(device),
            Self::GlobalCapacityExhausted => None,
        }
    }
}

/// Errors that can occur while loading or validating a [`crate::ratelimit::Config`]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read configuration file `{}`: {source}", path.display())]
    Io {
        /// Path of the configuration file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not valid TOML or has unknown/mistyped keys
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but describes an unusable limiter
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Error returned by [`crate::ratelimit::RateLimiter::execute`]
#[derive(Error, Debug)]
pub enum ExecuteError<E> {
    /// The request was never sent because admission failed
    #[error("Request was not admitted")]
    Admission(#[from] RateLimitError),

    /// The request was sent and the transport reported an error
    #[error("Request to device failed")]
    Device(#[source] E),
}

impl<E> ExecuteError<E> {
    /// The transport error, if the request got that far
    pub fn into_device_error(self) -> Option<E> {
        match self {
            Self::Device(e) => Some(e),
            Self::Admission(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::error::Error as _;

    #[test]
    fn test_would_block() {
        let device = DeviceKey::from("10.0.0.5");
        assert!(RateLimitError::GlobalCapacityExhausted.would_block());
        assert!(
            RateLimitError::DeviceCapacityExhausted {
                device: device.clone()
            }
            .would_block()
        );
        assert!(
            RateLimitError::IntervalPending {
                device: device.clone(),
                retry_after: Duration::from_millis(20),
            }
            .would_block()
        );
        assert!(!RateLimitError::CircuitOpen { device }.would_block());
    }

    #[test]
    fn test_error_messages() {
        let err = RateLimitError::IntervalPending {
            device: DeviceKey::from("Plug-1.local"),
            retry_after: Duration::from_millis(150),
        };
        assert_eq!(
            err.to_string(),
            "Device plug-1.local may not be contacted for another 150ms"
        );
        assert_eq!(err.device(), Some(&DeviceKey::from("plug-1.local")));
        assert_eq!(RateLimitError::GlobalCapacityExhausted.device(), None);
    }

    #[test]
    fn test_execute_error_does_not_repeat_its_source() {
        let err: ExecuteError<std::io::Error> = RateLimitError::GlobalCapacityExhausted.into();
        let source = err.source().unwrap().to_string();
        assert_eq!(source, "Global concurrency limit reached");
        assert!(!err.to_string().contains(&source));

        let err = ExecuteError::Device(std::io::Error::other("connection reset"));
        assert_eq!(err.to_string(), "Request to device failed");
        assert_eq!(err.source().unwrap().to_string(), "connection reset");
    }
}
