//! Classify request errors into "the device could not be reached" and
//! everything else.
//!
//! Only connectivity failures should count against a device's circuit
//! breaker. A device that answers with "not found" or rejects our credentials
//! is alive, and isolating it would hide the real problem from the user.

use std::error::Error;
use std::io;

use tokio::time::error::Elapsed;

use crate::DeviceError;
use crate::ratelimit::{ExecuteError, RateLimitError};

/// Fragments of error messages that indicate the device could not be
/// reached, for errors whose type we cannot inspect
const UNREACHABLE_MESSAGES: &[&str] = &[
    "connection refused",
    "connection reset",
    "no route to host",
    "network unreachable",
    "network is unreachable",
    "i/o timeout",
    "deadline exceeded",
];

/// An extension trait to determine whether a request failed because the
/// device could not be reached.
///
/// Implemented for the error types this crate knows about and for any
/// `Result` whose error is an [`Error`]; `Ok` is never a connectivity failure.
pub trait ConnectivityExt {
    /// Whether this outcome should be recorded as a failure with the device's
    /// circuit breaker
    fn is_connectivity_failure(&self) -> bool;
}

impl ConnectivityExt for DeviceError {
    fn is_connectivity_failure(&self) -> bool {
        self.is_unreachable()
    }
}

impl ConnectivityExt for RateLimitError {
    fn is_connectivity_failure(&self) -> bool {
        matches!(
            self,
            Self::Cancelled { .. } | Self::DeadlineExceeded { .. }
        )
    }
}

impl ConnectivityExt for io::Error {
    fn is_connectivity_failure(&self) -> bool {
        is_connectivity_failure(self)
    }
}

impl ConnectivityExt for Elapsed {
    fn is_connectivity_failure(&self) -> bool {
        true
    }
}

impl<E> ConnectivityExt for ExecuteError<E>
where
    E: Error + 'static,
{
    fn is_connectivity_failure(&self) -> bool {
        match self {
            Self::Admission(e) => e.is_connectivity_failure(),
            Self::Device(e) => is_connectivity_failure(e),
        }
    }
}

impl<T, E> ConnectivityExt for Result<T, E>
where
    E: Error + 'static,
{
    fn is_connectivity_failure(&self) -> bool {
        self.as_ref().err().is_some_and(|e| is_connectivity_failure(e))
    }
}

/// Decide whether `error` means the device could not be reached.
///
/// The error and its `source()` chain are searched for a type with a known
/// meaning first:
///
/// - [`DeviceError::Offline`] and [`DeviceError::Timeout`] are connectivity
///   failures, all other [`DeviceError`]s are not
/// - cancelled or timed out admissions and [`tokio::time::error::Elapsed`]
///   are connectivity failures
/// - I/O errors of a connection or timeout kind are connectivity failures
///
/// If no error in the chain has a known type, the messages of all errors in
/// the chain are matched case-insensitively against phrases like
/// "connection refused" or "no route to host".
///
/// ```
/// use fleetgate_lib::{DeviceError, is_connectivity_failure};
/// use std::io;
///
/// assert!(is_connectivity_failure(&DeviceError::Offline));
/// assert!(!is_connectivity_failure(&DeviceError::NotFound));
///
/// let err = io::Error::other("dial tcp 10.0.0.2:80: Connection Refused");
/// assert!(is_connectivity_failure(&err));
/// ```
#[must_use]
pub fn is_connectivity_failure(error: &(dyn Error + 'static)) -> bool {
    if let Some(verdict) = chain(error).find_map(classify) {
        return verdict;
    }
    chain(error).any(|e| mentions_unreachable(&e.to_string()))
}

/// Classify a single error by its type, if it has a known meaning
fn classify(error: &(dyn Error + 'static)) -> Option<bool> {
    if let Some(e) = error.downcast_ref::<DeviceError>() {
        return Some(e.is_connectivity_failure());
    }
    if let Some(e) = error.downcast_ref::<RateLimitError>() {
        return Some(e.is_connectivity_failure());
    }
    if error.is::<Elapsed>() {
        return Some(true);
    }
    if let Some(e) = error.downcast_ref::<io::Error>() {
        if is_unreachable_io(e.kind()) {
            return Some(true);
        }
        // `io::Error::source` skips the wrapped error itself, so look at it
        // directly
        return e.get_ref().and_then(|inner| classify(inner));
    }
    None
}

fn is_unreachable_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::HostUnreachable
    )
}

fn mentions_unreachable(message: &str) -> bool {
    let message = message.to_lowercase();
    UNREACHABLE_MESSAGES
        .iter()
        .any(|fragment| message.contains(fragment))
}

/// Iterate over an error and all of its sources
fn chain<'a>(
    error: &'a (dyn Error + 'static),
) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    std::iter::successors(Some(error), |&e| e.source())
}
