use std::fmt;
use std::io;
use std::time::Duration;

use fleetgate_lib::ratelimit::{Config, GenerationConfig, RateLimiter};
use fleetgate_lib::{ConnectivityExt, DeviceError, Generation, is_connectivity_failure};

/// Error type of a transport this crate knows nothing about
#[derive(Debug)]
struct RpcError(String);

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rpc call failed: {}", self.0)
    }
}

impl std::error::Error for RpcError {}

#[tokio::test(start_paused = true)]
async fn test_deadline_exceeded_is_connectivity_failure() {
    let config = Config::default().with_generation(
        Generation::Gen1,
        GenerationConfig {
            max_concurrent: 1,
            min_interval: Duration::ZERO,
            circuit_threshold: 3,
        },
    );
    let limiter = RateLimiter::new(config).unwrap();
    let _held = limiter.acquire("10.0.0.2", 1).await.unwrap();

    let result = limiter
        .acquire_timeout("10.0.0.2", 1, Duration::from_millis(5))
        .await;
    assert!(result.is_connectivity_failure());
}

#[test]
fn test_not_found_is_not_connectivity_failure() {
    assert!(!is_connectivity_failure(&DeviceError::NotFound));
}

#[test]
fn test_connection_refused_text_is_connectivity_failure() {
    let err = RpcError("dial tcp 192.168.1.9:80: connect: connection refused".to_string());
    assert!(is_connectivity_failure(&err));

    let err = RpcError("method Switch.Set not found".to_string());
    assert!(!is_connectivity_failure(&err));
}

#[test]
fn test_no_error_is_not_connectivity_failure() {
    let ok: Result<&str, RpcError> = Ok("on");
    assert!(!ok.is_connectivity_failure());
}

#[test]
fn test_io_errors_from_sockets() {
    let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
    assert!(refused.is_connectivity_failure());

    let wrapped = io::Error::other(DeviceError::InvalidResponse("no json".to_string()));
    assert!(!wrapped.is_connectivity_failure());
}
