use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::Generation;
use crate::connectivity::ConnectivityExt;
use crate::ratelimit::{
    Config, ConfigError, Device, DeviceKey, DevicePermit, DeviceStats, DeviceStatsMap,
    ExecuteError, RateLimitError,
};

/// Registry of devices and owner of the global concurrency gate.
///
/// The `RateLimiter` is the central coordinator for device admission. It
/// creates a [`Device`] the first time an address is seen and never evicts
/// it, so every address maps to the same throttling state for the life of
/// the limiter.
///
/// # Architecture
///
/// - Each normalized address gets its own [`Device`] with a dedicated gate,
///   pacer and circuit breaker
/// - A global semaphore bounds concurrent requests across all devices
/// - Devices are created lazily when first requested
/// - Cloning is cheap and every clone shares the same state
///
/// # Examples
///
/// ```
/// use fleetgate_lib::ratelimit::RateLimiter;
/// use fleetgate_lib::Generation;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let limiter = RateLimiter::default();
///
/// let permit = limiter.acquire("192.168.1.40", Generation::Gen2).await?;
/// // ... talk to the device ...
/// limiter.record_success("192.168.1.40");
/// permit.release();
///
/// assert_eq!(limiter.stats("192.168.1.40").unwrap().in_flight, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Map of address to device state, created on demand
    devices: Arc<DashMap<DeviceKey, Arc<Device>>>,

    /// Global semaphore to enforce overall concurrency limit
    global: Arc<Semaphore>,

    config: Config,

    /// Number of device states constructed so far
    registrations: Arc<AtomicUsize>,
}

impl RateLimiter {
    /// Create a new `RateLimiter` with the given configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the configuration fails
    /// [`Config::validate`]
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_valid_config(config))
    }

    fn with_valid_config(config: Config) -> Self {
        Self {
            devices: Arc::new(DashMap::new()),
            global: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            registrations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Get an existing device or create a new one for the given address
    fn device(&self, key: DeviceKey, generation: Generation) -> Arc<Device> {
        if let Some(device) = self.devices.get(&key) {
            return Arc::clone(device.value());
        }

        match self.devices.entry(key) {
            // Another caller registered it between the lookup and the entry
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let device = Arc::new(Device::new(entry.key().clone(), generation, &self.config));
                self.registrations.fetch_add(1, Ordering::Relaxed);
                log::debug!("Registered device {} as {generation}", device.key);
                entry.insert(Arc::clone(&device));
                device
            }
        }
    }

    /// Look up a device without registering it
    fn known(&self, address: impl Into<DeviceKey>) -> Option<Arc<Device>> {
        let key: DeviceKey = address.into();
        self.devices.get(&key).map(|device| Arc::clone(device.value()))
    }

    async fn admit(&self, device: &Arc<Device>) -> Result<DevicePermit, RateLimitError> {
        let admission = device.check_circuit()?;
        let global_slot = Arc::clone(&self.global)
            .acquire_owned()
            .await
            // SAFETY: this should not panic as we never close the semaphore
            .expect("Global semaphore was closed unexpectedly");
        Ok(device.admit(admission, global_slot).await)
    }

    /// Wait until a request to `address` may be sent.
    ///
    /// Admission checks the device's circuit breaker first and fails without
    /// consuming any capacity if it is open. It then waits for a global slot,
    /// a device slot and finally for the device's pacing interval, keeping
    /// both slots while it paces.
    ///
    /// `generation` only applies when the device is seen for the first time;
    /// use [`RateLimiter::set_generation`] to change the tier of a known
    /// device. Dropping the returned future releases every slot acquired so
    /// far.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::CircuitOpen`] if the device's circuit is open
    pub async fn acquire(
        &self,
        address: impl Into<DeviceKey>,
        generation: impl Into<Generation>,
    ) -> Result<DevicePermit, RateLimitError> {
        let device = self.device(address.into(), generation.into());
        self.admit(&device).await
    }

    /// Like [`RateLimiter::acquire`], but give up as soon as `cancel`
    /// completes.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Cancelled`] if `cancel` completes before the
    /// request is admitted, and [`RateLimitError::CircuitOpen`] if the
    /// device's circuit is open
    pub async fn acquire_with_cancel(
        &self,
        address: impl Into<DeviceKey>,
        generation: impl Into<Generation>,
        cancel: impl Future,
    ) -> Result<DevicePermit, RateLimitError> {
        let device = self.device(address.into(), generation.into());
        tokio::select! {
            biased;
            _ = cancel => {
                log::trace!("Admission to {} cancelled", device.key);
                Err(RateLimitError::Cancelled {
                    device: device.key.clone(),
                })
            }
            result = self.admit(&device) => result,
        }
    }

    /// Like [`RateLimiter::acquire`], but give up once `timeout` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::DeadlineExceeded`] if the request is not
    /// admitted within `timeout`, and [`RateLimitError::CircuitOpen`] if the
    /// device's circuit is open
    pub async fn acquire_timeout(
        &self,
        address: impl Into<DeviceKey>,
        generation: impl Into<Generation>,
        timeout: Duration,
    ) -> Result<DevicePermit, RateLimitError> {
        let device = self.device(address.into(), generation.into());
        match tokio::time::timeout(timeout, self.admit(&device)).await {
            Ok(result) => result,
            Err(_) => Err(RateLimitError::DeadlineExceeded {
                device: device.key.clone(),
                timeout,
            }),
        }
    }

    /// Admit a request to `address` only if that is possible right now.
    ///
    /// Checks run in the same order as in [`RateLimiter::acquire`]. Any slot
    /// taken before a later check refuses is released again before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::CircuitOpen`] if the device's circuit is
    /// open, or one of the refusals for which [`RateLimitError::would_block`]
    /// holds if admission would have to wait
    pub fn try_acquire(
        &self,
        address: impl Into<DeviceKey>,
        generation: impl Into<Generation>,
    ) -> Result<DevicePermit, RateLimitError> {
        let device = self.device(address.into(), generation.into());
        let admission = device.check_circuit()?;
        let global_slot = Arc::clone(&self.global)
            .try_acquire_owned()
            .map_err(|_| RateLimitError::GlobalCapacityExhausted)?;
        device.try_admit(admission, global_slot)
    }

    /// Send a request to a device under admission control.
    ///
    /// This method:
    /// 1. Waits for admission as [`RateLimiter::acquire`] does
    /// 2. Runs `request` while holding the permit
    /// 3. Records a failure with the circuit breaker if the request failed
    ///    with a connectivity error (see [`crate::is_connectivity_failure`]),
    ///    and a success otherwise
    /// 4. Releases the permit
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError::Admission`] if the request was never sent and
    /// [`ExecuteError::Device`] with the transport's error if it failed
    pub async fn execute<F, Fut, T, E>(
        &self,
        address: impl Into<DeviceKey>,
        generation: impl Into<Generation>,
        request: F,
    ) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        let device = self.device(address.into(), generation.into());
        let permit = self.admit(&device).await?;

        let result = request().await;
        if result.is_connectivity_failure() {
            device.circuit().record_failure();
        } else {
            device.circuit().record_success();
        }
        permit.release();

        result.map_err(ExecuteError::Device)
    }

    /// Report that a request to `address` reached the device.
    ///
    /// Unknown addresses are ignored.
    pub fn record_success(&self, address: impl Into<DeviceKey>) {
        if let Some(device) = self.known(address) {
            device.circuit().record_success();
        }
    }

    /// Report that a request to `address` could not reach the device.
    ///
    /// Unknown addresses are ignored.
    pub fn record_failure(&self, address: impl Into<DeviceKey>) {
        if let Some(device) = self.known(address) {
            device.circuit().record_failure();
        }
    }

    /// Throttle a known device as `generation` from now on.
    ///
    /// Requests already admitted keep their slots on the old gate, so for a
    /// short while the device may see the old and the new concurrency limit
    /// combined. The circuit breaker is not affected.
    ///
    /// Returns true if the device's generation changed, false if the device
    /// is unknown or already had that generation.
    pub fn set_generation(
        &self,
        address: impl Into<DeviceKey>,
        generation: impl Into<Generation>,
    ) -> bool {
        self.known(address)
            .is_some_and(|device| device.set_generation(generation.into(), &self.config))
    }

    /// Close the circuit of a device and clear its counters
    pub fn reset(&self, address: impl Into<DeviceKey>) {
        if let Some(device) = self.known(address) {
            device.circuit().reset();
        }
    }

    /// Close the circuits of all devices
    pub fn reset_all(&self) {
        for device in self.devices.iter() {
            device.circuit().reset();
        }
    }

    /// Whether the circuit of `address` is currently open.
    ///
    /// False for unknown devices.
    #[must_use]
    pub fn is_circuit_open(&self, address: impl Into<DeviceKey>) -> bool {
        self.known(address)
            .is_some_and(|device| device.circuit().is_open())
    }

    /// Get statistics for a specific device, if it has been seen
    #[must_use]
    pub fn stats(&self, address: impl Into<DeviceKey>) -> Option<DeviceStats> {
        self.known(address).map(|device| device.stats())
    }

    /// Get statistics for all devices, ordered by address
    #[must_use]
    pub fn all_stats(&self) -> Vec<DeviceStats> {
        let mut stats: Vec<_> = self.devices.iter().map(|device| device.stats()).collect();
        stats.sort_by(|a, b| a.address.cmp(&b.address));
        stats
    }

    /// Get statistics for all devices keyed by address
    #[must_use]
    pub fn stats_map(&self) -> DeviceStatsMap {
        DeviceStatsMap::from(self.all_stats())
    }

    /// Number of devices seen so far
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Number of device states ever constructed.
    ///
    /// Always equal to [`RateLimiter::device_count`], since devices are
    /// registered once and never evicted.
    #[must_use]
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::Relaxed)
    }

    /// Get the number of available global permits
    ///
    /// This shows how many more requests can be admitted across all devices
    /// before hitting the global concurrency limit.
    #[must_use]
    pub fn available_global_permits(&self) -> usize {
        self.global.available_permits()
    }

    /// The configuration this limiter was created with
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_valid_config(Config::default())
    }
}
