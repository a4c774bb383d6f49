//! Bucketed sliding window.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::backend::Limiter;
use crate::clock::{self, Clock};
use crate::config::SlidingWindowConfig;
use crate::error::Result;

/// Approximates a sliding window with a ring of `size` sub-window counters.
///
/// A timestamp `t` lands in bucket `floor(t / sub_duration) % size`, and the
/// effective count is the sum over the ring. Stale buckets are cleared
/// lazily on the next call, so boundary precision is one sub-window.
///
/// The shared variant keeps one entry per admitted call instead and is exact;
/// the two are not bit-identical at window boundaries.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    rate: u64,
    duration: Duration,
    sub_duration: Duration,
    size: usize,
    clock: Arc<dyn Clock>,
    state: Mutex<SlidingWindowState>,
}

#[derive(Debug)]
struct SlidingWindowState {
    buckets: Vec<u64>,
    /// Timestamp of the last admitted call
    last: Duration,
}

impl SlidingWindowState {
    fn count(&self) -> u64 {
        self.buckets.iter().sum()
    }

    fn reset(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = 0);
    }

    /// Zero the buckets after `start` up to and including `end`, wrapping.
    fn reset_range(&mut self, start: usize, end: usize) {
        let size = self.buckets.len();
        let mut i = (start + 1) % size;
        loop {
            self.buckets[i] = 0;
            if i == end {
                break;
            }
            i = (i + 1) % size;
        }
    }
}

impl SlidingWindowLimiter {
    /// Create a limiter on the system clock.
    pub fn new(config: SlidingWindowConfig) -> Result<Self> {
        Self::with_clock(config, clock::system())
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(config: SlidingWindowConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let last = clock.now();

        Ok(Self {
            rate: config.rate,
            duration: config.duration,
            sub_duration: config.sub_duration(),
            size: config.size as usize,
            clock,
            state: Mutex::new(SlidingWindowState {
                buckets: vec![0; config.size as usize],
                last,
            }),
        })
    }

    /// Attempt to admit one call now.
    pub fn try_allow(&self) -> bool {
        self.allow_at(self.clock.now())
    }

    /// Attempt to admit one call at `now`.
    pub fn allow_at(&self, now: Duration) -> bool {
        let mut state = self.state.lock();

        let last_index = self.bucket_index(state.last);
        let index = self.bucket_index(now);

        if now.saturating_sub(state.last) > self.duration - self.sub_duration {
            state.reset();
        } else if last_index != index {
            state.reset_range(last_index, index);
        }

        let count = state.count();
        if count >= self.rate {
            trace!(count = count, rate = self.rate, "Sliding window limit reached");
            return false;
        }
        state.buckets[index] += 1;
        state.last = now;
        true
    }

    /// Sum of all sub-window counters as of the last call.
    pub fn count(&self) -> u64 {
        self.state.lock().count()
    }

    /// Length of one sub-window.
    pub fn sub_duration(&self) -> Duration {
        self.sub_duration
    }

    fn bucket_index(&self, at: Duration) -> usize {
        ((at.as_nanos() / self.sub_duration.as_nanos()) % self.size as u128) as usize
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    async fn allow(&self) -> Result<bool> {
        Ok(self.try_allow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const START: Duration = Duration::from_secs(1_000);

    /// 4 calls per second over 4 sub-windows of 250ms, clock on a bucket 0 boundary.
    fn limiter() -> (SlidingWindowLimiter, ManualClock) {
        let clock = ManualClock::new(START);
        let config = SlidingWindowConfig::new(4, Duration::from_secs(1), 4);
        let limiter = SlidingWindowLimiter::with_clock(config, Arc::new(clock.clone())).unwrap();
        (limiter, clock)
    }

    fn at(ms: u64) -> Duration {
        START + Duration::from_millis(ms)
    }

    #[test]
    fn test_bucket_index_wraps() {
        let (limiter, _clock) = limiter();
        assert_eq!(limiter.sub_duration(), Duration::from_millis(250));
        assert_eq!(limiter.bucket_index(at(0)), 0);
        assert_eq!(limiter.bucket_index(at(260)), 1);
        assert_eq!(limiter.bucket_index(at(999)), 3);
        assert_eq!(limiter.bucket_index(at(1_000)), 0);
    }

    #[test]
    fn test_evenly_spread_calls_then_denied() {
        let (limiter, _clock) = limiter();

        for ms in [0, 250, 500, 750] {
            assert!(limiter.allow_at(at(ms)), "call at {}ms should be admitted", ms);
        }
        assert!(!limiter.allow_at(at(900)));
        assert_eq!(limiter.count(), 4);
    }

    #[test]
    fn test_oldest_bucket_ages_out() {
        let (limiter, _clock) = limiter();

        for ms in [0, 250, 500, 750] {
            assert!(limiter.allow_at(at(ms)));
        }
        // Bucket 0 is reused one window later and its old count is dropped
        assert!(limiter.allow_at(at(1_000)));
        assert!(!limiter.allow_at(at(1_100)));
        assert_eq!(limiter.count(), 4);
    }

    #[test]
    fn test_burst_is_not_forgotten_mid_window() {
        let (limiter, _clock) = limiter();

        for _ in 0..4 {
            assert!(limiter.allow_at(at(10)));
        }
        // A fixed window of the same length starting at 500ms would admit here
        assert!(!limiter.allow_at(at(600)));
        assert!(!limiter.allow_at(at(700)));
    }

    #[test]
    fn test_boundary_burst_is_bounded() {
        let (limiter, _clock) = limiter();

        let first = (0..8).filter(|_| limiter.allow_at(at(0))).count();
        let second = (0..8).filter(|_| limiter.allow_at(at(999))).count();

        assert_eq!(first, 4);
        assert!(second <= 4);
        assert!(first + second <= 8);
    }

    #[test]
    fn test_gap_longer_than_window_resets_everything() {
        let (limiter, _clock) = limiter();

        for ms in [0, 300, 600] {
            assert!(limiter.allow_at(at(ms)));
        }
        // More than duration - sub_duration since the last admitted call
        for _ in 0..4 {
            assert!(limiter.allow_at(at(1_400)));
        }
        assert!(!limiter.allow_at(at(1_400)));
    }

    #[test]
    fn test_denial_does_not_change_counts() {
        let (limiter, _clock) = limiter();

        for ms in [0, 0, 250, 250] {
            assert!(limiter.allow_at(at(ms)));
        }
        for ms in [300, 400, 500] {
            assert!(!limiter.allow_at(at(ms)));
        }
        assert_eq!(limiter.count(), 4);

        // Bucket 0 ages out exactly as if the denials never happened
        assert!(limiter.allow_at(at(1_000)));
        assert!(limiter.allow_at(at(1_000)));
        assert!(!limiter.allow_at(at(1_000)));
    }

    #[test]
    fn test_single_bucket_behaves_like_window() {
        let clock = ManualClock::new(START);
        let config = SlidingWindowConfig::new(2, Duration::from_secs(1), 1);
        let limiter = SlidingWindowLimiter::with_clock(config, Arc::new(clock)).unwrap();

        assert!(limiter.allow_at(at(0)));
        assert!(limiter.allow_at(at(0)));
        assert!(!limiter.allow_at(at(0)));
        assert!(limiter.allow_at(at(1)));
    }

    #[test]
    fn test_concurrent_calls_admit_exactly_rate() {
        let rate = 40;
        let config = SlidingWindowConfig::new(rate, Duration::from_secs(60), 6);
        let limiter = Arc::new(SlidingWindowLimiter::new(config).unwrap());

        let admitted = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..rate * 10)
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

        assert_eq!(admitted, rate as usize);
    }
}
