//! Per-device circuit breaker.
//!
//! A breaker stops requests to a device that keeps failing to answer, and
//! periodically lets trial requests through to find out whether it came back.
//!
//! ```text
//! Closed   --(failure_threshold consecutive failures)--> Open
//! Open     --(open_duration elapsed, next check)-------> HalfOpen
//! HalfOpen --(success_threshold consecutive successes)-> Closed
//! HalfOpen --(any failure)-----------------------------> Open
//! ```
//!
//! The Open → `HalfOpen` transition happens lazily inside [`CircuitBreaker::admit`];
//! there is no background timer.
//!
//! Every admission hands out a [`CircuitPass`]. A pass granted while
//! half-open is a trial and stays counted until it is given back with
//! [`CircuitBreaker::release`], whether or not an outcome was recorded.

use serde::Serialize;
use serde::ser::SerializeStruct;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use strum::Display;
use tokio::time::Instant;

use crate::Generation;
use crate::ratelimit::Config;

/// Current state of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected without contacting the device
    Open,
    /// Trial requests are admitted to find out whether the device recovered
    HalfOpen,
}

/// Point-in-time snapshot of a [`CircuitBreaker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitStats {
    /// State at the time of the snapshot
    pub state: CircuitState,
    /// Failures recorded since the last success or reset
    pub consecutive_failures: u32,
    /// Successes recorded during the current half-open period
    pub consecutive_successes: u32,
    /// When the circuit last opened, if it is open or half-open
    pub opened_at: Option<Instant>,
}

impl Serialize for CircuitStats {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let opened_ms_ago = self.opened_at.map(|at| at.elapsed().as_millis());

        let mut s = serializer.serialize_struct("CircuitStats", 4)?;
        s.serialize_field("state", &self.state)?;
        s.serialize_field("consecutive_failures", &self.consecutive_failures)?;
        s.serialize_field("consecutive_successes", &self.consecutive_successes)?;
        s.serialize_field("opened_ms_ago", &opened_ms_ago)?;
        s.end()
    }
}

/// Permission to send one request, granted by [`CircuitBreaker::admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a trial pass must be released or it keeps counting against the trial limit"]
pub struct CircuitPass {
    /// Half-open period the trial belongs to, `None` outside half-open
    trial_of: Option<u64>,
}

impl CircuitPass {
    /// Whether the pass was granted as a half-open trial
    #[must_use]
    pub const fn is_trial(&self) -> bool {
        self.trial_of.is_some()
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    /// Trial passes of the current half-open period not yet released
    pending_trials: u32,
    /// Incremented on every Open → `HalfOpen` transition, never reset
    half_open_period: u64,
}

impl Inner {
    const fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            pending_trials: 0,
            half_open_period: 0,
        }
    }

    fn close(&mut self) {
        *self = Self {
            half_open_period: self.half_open_period,
            ..Self::closed()
        };
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.consecutive_successes = 0;
        self.pending_trials = 0;
    }
}

/// Failure-isolating state machine for a single device.
///
/// All state lives behind a lock private to the breaker, so checking a
/// breaker never contends with the device registry.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Name used in log messages, usually the device address
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    open_duration: Duration,
    half_open_max_trials: Option<u32>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker
    ///
    /// * `failure_threshold` - consecutive failures that open the circuit
    /// * `success_threshold` - consecutive half-open successes that close it
    /// * `open_duration` - how long the circuit rejects requests once open
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        success_threshold: u32,
        open_duration: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            success_threshold,
            open_duration,
            half_open_max_trials: None,
            inner: Mutex::new(Inner::closed()),
        }
    }

    /// Create a breaker with the thresholds `config` prescribes for a device
    /// of the given generation
    #[must_use]
    pub fn from_config(name: impl Into<String>, config: &Config, generation: Generation) -> Self {
        Self::new(
            name,
            config.for_generation(generation).circuit_threshold,
            config.circuit_success_threshold,
            config.circuit_open_duration,
        )
        .with_half_open_max_trials(config.half_open_max_trials)
    }

    /// Limit admissions while half-open.
    ///
    /// With `Some(n)`, at most `n` trial passes may be outstanding at once;
    /// further checks are rejected until a trial is released or its outcome
    /// closes or reopens the circuit. `None` (the default) admits every
    /// request while half-open.
    #[must_use]
    pub fn with_half_open_max_trials(mut self, trials: Option<u32>) -> Self {
        self.half_open_max_trials = trials;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check whether a request may be sent, moving an expired Open circuit to
    /// `HalfOpen` on the way.
    ///
    /// Returns `None` if the request must not be sent. A returned trial pass
    /// counts against the half-open trial limit until it is handed to
    /// [`CircuitBreaker::release`].
    pub fn admit(&self) -> Option<CircuitPass> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(CircuitPass { trial_of: None }),
            CircuitState::Open => {
                let expired = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.open_duration);
                if !expired {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                inner.half_open_period = inner.half_open_period.wrapping_add(1);
                inner.pending_trials = 1;
                log::info!(
                    "Circuit for {} is half-open after {}ms, admitting trial requests",
                    self.name,
                    self.open_duration.as_millis()
                );
                Some(CircuitPass {
                    trial_of: Some(inner.half_open_period),
                })
            }
            CircuitState::HalfOpen => match self.half_open_max_trials {
                Some(max) if inner.pending_trials >= max => None,
                _ => {
                    inner.pending_trials = inner.pending_trials.saturating_add(1);
                    Some(CircuitPass {
                        trial_of: Some(inner.half_open_period),
                    })
                }
            },
        }
    }

    /// Like [`CircuitBreaker::admit`], for callers that never release.
    ///
    /// With a half-open trial limit, a trial admitted this way stays counted
    /// until the half-open period ends.
    pub fn allow(&self) -> bool {
        self.admit().is_some()
    }

    /// Hand back a pass once its request finished or was abandoned.
    ///
    /// Passes from an earlier half-open period are ignored, so they can never
    /// free a trial slot of the current one.
    pub fn release(&self, pass: CircuitPass) {
        let Some(period) = pass.trial_of else {
            return;
        };
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.half_open_period == period {
            inner.pending_trials = inner.pending_trials.saturating_sub(1);
        }
    }

    /// Record that a request reached the device
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
                if inner.consecutive_successes >= self.success_threshold {
                    inner.close();
                    log::info!("Circuit for {} closed, device is responding again", self.name);
                }
            }
            // Outcome of a request admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    /// Record that a request could not reach the device
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            CircuitState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                inner.open();
                log::warn!(
                    "Circuit for {} opened after {} consecutive failures, rejecting requests for {}ms",
                    self.name,
                    inner.consecutive_failures,
                    self.open_duration.as_millis()
                );
            }
            CircuitState::HalfOpen => {
                inner.open();
                log::warn!("Circuit for {} reopened, trial request failed", self.name);
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    /// Force the circuit closed and clear all counters
    pub fn reset(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            log::debug!("Circuit for {} reset from {}", self.name, inner.state);
        }
        inner.close();
    }

    /// Current state, without performing the lazy Open → `HalfOpen` transition
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether the circuit is currently open
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Snapshot of the breaker's state and counters
    pub fn stats(&self) -> CircuitStats {
        let inner = self.lock();
        CircuitStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            opened_at: inner.opened_at,
        }
    }
}
