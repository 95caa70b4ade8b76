//! `fleetgate` decides when a request may be sent to a device in a fleet of
//! network devices, and stops sending requests to devices that no longer
//! answer.
//!
//! Wrap every device request in [`ratelimit::RateLimiter::execute`]:
//! ```
//! use fleetgate_lib::ratelimit::RateLimiter;
//! use fleetgate_lib::{DeviceError, Generation};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let limiter = RateLimiter::default();
//!   let status = limiter
//!       .execute("192.168.1.40", Generation::Gen1, || async {
//!           // Talk to the device here
//!           Ok::<_, DeviceError>("on")
//!       })
//!       .await?;
//!   assert_eq!(status, "on");
//!   Ok(())
//! }
//! ```
//!
//! For finer control, acquire a permit yourself and report the outcome
//! using [`is_connectivity_failure`]:
//!
//! ```
//! use fleetgate_lib::ratelimit::RateLimiter;
//! use fleetgate_lib::{DeviceError, is_connectivity_failure};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let limiter = RateLimiter::default();
//!   let permit = limiter.acquire("garage.local", 2).await?;
//!
//!   let outcome: Result<(), DeviceError> = Err(DeviceError::Offline);
//!   match &outcome {
//!       Err(e) if is_connectivity_failure(e) => limiter.record_failure("garage.local"),
//!       _ => limiter.record_success("garage.local"),
//!   }
//!   drop(permit);
//!   Ok(())
//! }
//! ```
#![warn(missing_docs)]

mod connectivity;
mod types;

pub mod ratelimit;

pub use connectivity::{ConnectivityExt, is_connectivity_failure};
pub use types::*;
