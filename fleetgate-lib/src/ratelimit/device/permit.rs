use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

use super::device::Device;
use super::key::DeviceKey;
use crate::Generation;
use crate::ratelimit::CircuitPass;

/// Proof of admission to a device.
///
/// Hold the permit for as long as the request to the device is in flight.
/// Dropping it (or calling [`DevicePermit::release`]) decrements the
/// device's in-flight count and hands the circuit breaker's pass back, then
/// frees the device slot, then the global slot. Because the permit is
/// consumed on release, a slot can never be returned twice.
///
/// A half-open trial therefore ends when its permit drops, even if the
/// request was cancelled before any outcome was recorded.
///
/// Each permit keeps a handle to the exact gates it was taken from, so a
/// permit issued before [`crate::ratelimit::RateLimiter::set_generation`]
/// resized the device's gate still returns its slot to the old gate.
#[derive(Debug)]
#[must_use = "the device slot is released as soon as the permit is dropped"]
pub struct DevicePermit {
    device: Arc<Device>,
    generation: Generation,
    admitted_at: Instant,
    pass: CircuitPass,
    // Field order is release order: device slot first, then global slot
    _device_slot: OwnedSemaphorePermit,
    _global_slot: OwnedSemaphorePermit,
}

impl DevicePermit {
    pub(super) fn new(
        device: Arc<Device>,
        generation: Generation,
        admitted_at: Instant,
        pass: CircuitPass,
        device_slot: OwnedSemaphorePermit,
        global_slot: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            device,
            generation,
            admitted_at,
            pass,
            _device_slot: device_slot,
            _global_slot: global_slot,
        }
    }

    /// The device this permit admits a request to
    #[must_use]
    pub fn device(&self) -> &DeviceKey {
        &self.device.key
    }

    /// The generation whose limits applied when the permit was granted
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// When the admission was granted
    #[must_use]
    pub const fn admitted_at(&self) -> Instant {
        self.admitted_at
    }

    /// Release the permit; equivalent to dropping it
    pub fn release(self) {}
}

impl Drop for DevicePermit {
    fn drop(&mut self) {
        self.device.finish_request(self.pass);
        log::trace!(
            "Released {} after {}ms",
            self.device.key,
            self.admitted_at.elapsed().as_millis()
        );
    }
}
