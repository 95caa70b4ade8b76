use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Enforces a minimum interval between admissions to one device.
///
/// The timestamp of the last admission is only read and written under the
/// pacer's lock, and a slot is only taken once the interval has fully
/// elapsed, so concurrent waiters for the same device stay spaced apart even
/// when the device admits several requests at once.
#[derive(Debug, Default)]
pub(crate) struct Pacer {
    last_request: Mutex<Option<Instant>>,
}

impl Pacer {
    /// Take an admission slot now if `interval` has passed since the last
    /// one, otherwise return how long the caller still has to wait
    pub(crate) fn try_admit(&self, interval: Duration) -> Result<Instant, Duration> {
        let mut last_request = self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if let Some(last) = *last_request {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < interval {
                return Err(interval - elapsed);
            }
        }

        *last_request = Some(now);
        Ok(now)
    }

    /// Wait until `interval` has passed since the last admission and take the
    /// slot.
    ///
    /// Dropping the returned future before it completes leaves the pacer
    /// untouched.
    pub(crate) async fn admit(&self, interval: Duration) -> Instant {
        loop {
            match self.try_admit(interval) {
                Ok(admitted_at) => return admitted_at,
                // Another waiter may take the slot first, so check again
                Err(remaining) => tokio::time::sleep(remaining).await,
            }
        }
    }

    pub(crate) fn last_request(&self) -> Option<Instant> {
        *self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const INTERVAL: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn test_first_admission_is_immediate() {
        let pacer = Pacer::default();
        assert_eq!(pacer.last_request(), None);
        assert_eq!(pacer.try_admit(INTERVAL), Ok(Instant::now()));
        assert_eq!(pacer.last_request(), Some(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_admit_reports_remaining_time() {
        let pacer = Pacer::default();
        pacer.try_admit(INTERVAL).unwrap();

        tokio::time::advance(Duration::from_millis(30)).await;
        assert_eq!(pacer.try_admit(INTERVAL), Err(Duration::from_millis(70)));

        tokio::time::advance(Duration::from_millis(70)).await;
        assert!(pacer.try_admit(INTERVAL).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_never_waits() {
        let pacer = Pacer::default();
        for _ in 0..5 {
            assert!(pacer.try_admit(Duration::ZERO).is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_are_spaced() {
        let pacer = Arc::new(Pacer::default());
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pacer = Arc::clone(&pacer);
                tokio::spawn(async move { pacer.admit(INTERVAL).await })
            })
            .collect();

        let mut admitted = Vec::new();
        for handle in handles {
            admitted.push(handle.await.unwrap());
        }
        admitted.sort();

        assert_eq!(admitted[0], start);
        for pair in admitted.windows(2) {
            assert!(pair[1] - pair[0] >= INTERVAL, "{pair:?} too close");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_leaves_no_trace() {
        let pacer = Pacer::default();
        let first = pacer.try_admit(INTERVAL).unwrap();

        let wait = tokio::time::timeout(Duration::from_millis(10), pacer.admit(INTERVAL)).await;
        assert!(wait.is_err());
        assert_eq!(pacer.last_request(), Some(first));
    }
}
