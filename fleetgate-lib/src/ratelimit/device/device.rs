use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use super::key::DeviceKey;
use super::pacing::Pacer;
use super::permit::DevicePermit;
use super::stats::DeviceStats;
use crate::Generation;
use crate::ratelimit::{CircuitBreaker, CircuitPass, Config, RateLimitError};

/// Concurrency gate and pacing interval of the generation a device is
/// currently throttled as
#[derive(Debug)]
struct Tier {
    generation: Generation,
    gate: Arc<Semaphore>,
    min_interval: Duration,
}

impl Tier {
    fn new(generation: Generation, config: &Config) -> Self {
        let limits = config.for_generation(generation);
        Self {
            generation,
            gate: Arc::new(Semaphore::new(limits.max_concurrent)),
            min_interval: limits.min_interval,
        }
    }
}

/// Throttling and health state of a single device.
///
/// Each device maintains:
/// - A semaphore sized to its generation's concurrency limit
/// - A pacer enforcing the generation's minimum request interval
/// - A circuit breaker isolating it when it stops answering
/// - Counters for in-flight and admitted requests
///
/// Devices are created by [`crate::ratelimit::RateLimiter`] on first use and
/// live as long as the limiter.
#[derive(Debug)]
pub struct Device {
    /// The address this instance manages
    pub key: DeviceKey,

    /// Swapped wholesale when the device changes generation
    tier: RwLock<Arc<Tier>>,

    circuit: CircuitBreaker,

    pacer: Pacer,

    /// Requests admitted and not yet released
    in_flight: AtomicUsize,

    /// Requests admitted over the device's lifetime
    admitted: AtomicU64,

    /// Admission attempts refused because the circuit was open
    circuit_rejections: AtomicU64,
}

impl Device {
    /// Create the state for a device throttled as `generation`
    #[must_use]
    pub fn new(key: DeviceKey, generation: Generation, config: &Config) -> Self {
        let circuit = CircuitBreaker::from_config(key.to_string(), config, generation);
        Self {
            key,
            tier: RwLock::new(Arc::new(Tier::new(generation, config))),
            circuit,
            pacer: Pacer::default(),
            in_flight: AtomicUsize::new(0),
            admitted: AtomicU64::new(0),
            circuit_rejections: AtomicU64::new(0),
        }
    }

    fn tier(&self) -> Arc<Tier> {
        let tier = self.tier.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*tier)
    }

    /// The generation whose limits currently apply
    pub fn generation(&self) -> Generation {
        self.tier().generation
    }

    /// The device's circuit breaker
    pub const fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Number of admitted requests that have not been released yet
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// When the last request to this device was admitted
    pub fn last_request(&self) -> Option<Instant> {
        self.pacer.last_request()
    }

    /// Free slots on the device's current gate
    pub fn available_permits(&self) -> usize {
        self.tier().gate.available_permits()
    }

    /// Consult the circuit breaker before touching any gate.
    ///
    /// The returned guard hands the breaker's pass back if the caller gives
    /// up before the request is admitted. Once admitted, the pass travels
    /// with the [`DevicePermit`] and is handed back when the permit drops.
    pub(crate) fn check_circuit(&self) -> Result<CircuitAdmission<'_>, RateLimitError> {
        if let Some(pass) = self.circuit.admit() {
            Ok(CircuitAdmission {
                circuit: &self.circuit,
                pass,
                armed: true,
            })
        } else {
            self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
            Err(RateLimitError::CircuitOpen {
                device: self.key.clone(),
            })
        }
    }

    /// Wait for a device slot and for the pacing interval, holding the global
    /// slot throughout.
    ///
    /// Dropping the future releases whatever has been acquired so far,
    /// including `global_slot`.
    pub(crate) async fn admit(
        self: &Arc<Self>,
        admission: CircuitAdmission<'_>,
        global_slot: OwnedSemaphorePermit,
    ) -> DevicePermit {
        let tier = self.tier();
        let device_slot = Arc::clone(&tier.gate)
            .acquire_owned()
            .await
            // SAFETY: this should not panic as we never close the semaphore
            .expect("Device semaphore was closed unexpectedly");

        // Both slots stay held while pacing, so a slow device visibly
        // occupies concurrency instead of queueing silently
        let admitted_at = self.pacer.admit(tier.min_interval).await;
        self.grant(&tier, admitted_at, admission.commit(), device_slot, global_slot)
    }

    /// Non-blocking variant of [`Device::admit`].
    ///
    /// On refusal both slots are released before the error is returned.
    pub(crate) fn try_admit(
        self: &Arc<Self>,
        admission: CircuitAdmission<'_>,
        global_slot: OwnedSemaphorePermit,
    ) -> Result<DevicePermit, RateLimitError> {
        let tier = self.tier();
        let device_slot = Arc::clone(&tier.gate).try_acquire_owned().map_err(|_| {
            RateLimitError::DeviceCapacityExhausted {
                device: self.key.clone(),
            }
        })?;
        let admitted_at = self.pacer.try_admit(tier.min_interval).map_err(|retry_after| {
            RateLimitError::IntervalPending {
                device: self.key.clone(),
                retry_after,
            }
        })?;
        Ok(self.grant(
            &tier,
            admitted_at,
            admission.commit(),
            device_slot,
            global_slot,
        ))
    }

    fn grant(
        self: &Arc<Self>,
        tier: &Tier,
        admitted_at: Instant,
        pass: CircuitPass,
        device_slot: OwnedSemaphorePermit,
        global_slot: OwnedSemaphorePermit,
    ) -> DevicePermit {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.admitted.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "Admitted request to {} ({}), {} in flight",
            self.key,
            tier.generation,
            self.in_flight()
        );
        DevicePermit::new(
            Arc::clone(self),
            tier.generation,
            admitted_at,
            pass,
            device_slot,
            global_slot,
        )
    }

    pub(super) fn finish_request(&self, pass: CircuitPass) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.circuit.release(pass);
    }

    /// Throttle the device as `generation` from now on.
    ///
    /// Requests already holding a slot keep it and return it to the old gate;
    /// new requests queue on a fresh gate sized for the new generation. The
    /// circuit breaker is left untouched. Returns `false` if the device
    /// already had this generation.
    pub(crate) fn set_generation(&self, generation: Generation, config: &Config) -> bool {
        let mut tier = self.tier.write().unwrap_or_else(PoisonError::into_inner);
        if tier.generation == generation {
            return false;
        }
        let previous = tier.generation;
        *tier = Arc::new(Tier::new(generation, config));
        log::debug!(
            "Device {} switched from {previous} to {generation} with {} requests in flight",
            self.key,
            self.in_flight()
        );
        true
    }

    /// Snapshot of the device's counters and circuit state
    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            address: self.key.clone(),
            generation: self.generation(),
            in_flight: self.in_flight(),
            last_request: self.last_request(),
            admitted: self.admitted.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            circuit: self.circuit.stats(),
        }
    }
}

/// A pass granted by the circuit breaker for a request that is not yet
/// admitted by the gates
#[derive(Debug)]
pub(crate) struct CircuitAdmission<'a> {
    circuit: &'a CircuitBreaker,
    pass: CircuitPass,
    armed: bool,
}

impl CircuitAdmission<'_> {
    /// The request was admitted; the permit takes over the pass
    fn commit(mut self) -> CircuitPass {
        self.armed = false;
        self.pass
    }
}

impl Drop for CircuitAdmission<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.circuit.release(self.pass);
        }
    }
}
