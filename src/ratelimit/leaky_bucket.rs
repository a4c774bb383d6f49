//! Leaky bucket pacing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::backend::Limiter;
use crate::clock::{self, Clock};
use crate::config::RateConfig;
use crate::error::Result;

/// Enforces a minimum spacing of `duration / rate` between admitted calls.
///
/// There is no queue and no burst credit: a call that arrives too soon is
/// denied outright, and an admitted call restarts the spacing from its own
/// timestamp, so idle time is never banked.
#[derive(Debug)]
pub struct LeakyBucketLimiter {
    interval: Duration,
    clock: Arc<dyn Clock>,
    /// Timestamp of the last admitted call
    last: Mutex<Option<Duration>>,
}

impl LeakyBucketLimiter {
    /// Create a limiter on the system clock.
    pub fn new(config: RateConfig) -> Result<Self> {
        Self::with_clock(config, clock::system())
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(config: RateConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            interval: config.interval(),
            clock,
            last: Mutex::new(None),
        })
    }

    /// Attempt to admit one call now.
    pub fn try_allow(&self) -> bool {
        self.allow_at(self.clock.now())
    }

    /// Attempt to admit one call at `now`.
    pub fn allow_at(&self, now: Duration) -> bool {
        let mut last = self.last.lock();

        if let Some(previous) = *last {
            let elapsed = now.saturating_sub(previous);
            if elapsed < self.interval {
                trace!(
                    elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
                    interval_us = u64::try_from(self.interval.as_micros()).unwrap_or(u64::MAX),
                    "Leaky bucket call too soon"
                );
                return false;
            }
        }
        *last = Some(now);
        true
    }

    /// Minimum spacing between admitted calls.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait]
impl Limiter for LeakyBucketLimiter {
    async fn allow(&self) -> Result<bool> {
        Ok(self.try_allow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(rate: u64, duration: Duration) -> (LeakyBucketLimiter, ManualClock) {
        let clock = ManualClock::new(Duration::from_secs(500));
        let limiter =
            LeakyBucketLimiter::with_clock(RateConfig::new(rate, duration), Arc::new(clock.clone()))
                .unwrap();
        (limiter, clock)
    }

    #[test]
    fn test_first_call_admitted() {
        let (limiter, _clock) = limiter(10, Duration::from_secs(1));
        assert_eq!(limiter.interval(), Duration::from_millis(100));
        assert!(limiter.try_allow());
    }

    #[test]
    fn test_calls_closer_than_interval_denied() {
        let (limiter, clock) = limiter(10, Duration::from_secs(1));
        assert!(limiter.try_allow());

        clock.advance(Duration::from_millis(99));
        assert!(!limiter.try_allow());
    }

    #[test]
    fn test_calls_at_interval_admitted() {
        let (limiter, clock) = limiter(10, Duration::from_secs(1));
        assert!(limiter.try_allow());

        clock.advance(Duration::from_millis(100));
        assert!(limiter.try_allow());

        clock.advance(Duration::from_millis(150));
        assert!(limiter.try_allow());
    }

    #[test]
    fn test_no_burst_credit_after_idle() {
        let (limiter, clock) = limiter(10, Duration::from_secs(1));
        assert!(limiter.try_allow());

        clock.advance(Duration::from_secs(10));
        assert!(limiter.try_allow());
        assert!(!limiter.try_allow());
    }

    #[test]
    fn test_denial_does_not_move_last() {
        let (limiter, clock) = limiter(10, Duration::from_secs(1));
        assert!(limiter.try_allow());

        clock.advance(Duration::from_millis(60));
        assert!(!limiter.try_allow());

        // Spacing is measured from the admitted call, not the denied one
        clock.advance(Duration::from_millis(40));
        assert!(limiter.try_allow());
    }

    #[test]
    fn test_clock_going_backwards_is_denied() {
        let (limiter, clock) = limiter(10, Duration::from_secs(1));
        assert!(limiter.try_allow());

        clock.set(Duration::from_secs(400));
        assert!(!limiter.try_allow());
    }

    #[test]
    fn test_concurrent_calls_admit_one() {
        let limiter = Arc::new(
            LeakyBucketLimiter::new(RateConfig::new(1, Duration::from_secs(60))).unwrap(),
        );

        let admitted = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..32)
                .map(|_| {
                    let limiter = Arc::clone(&limiter);
                    scope.spawn(move || limiter.try_allow())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|allowed| *allowed)
                .count()
        });

        assert_eq!(admitted, 1);
    }
}
