//! Shared sliding window log.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

use super::handle::ScriptHandle;
use super::scripts::{Script, SLIDING_WINDOW};
use super::validate_key;
use crate::clock::{self, Clock};
use crate::config::RateConfig;
use crate::error::Result;
use crate::ratelimit::backend::Limiter;
use crate::store::ScriptStore;

/// Exact sliding window kept in the store as a sorted set of admitted
/// timestamps.
///
/// Before counting, entries at or before `now - duration` are purged. Unlike
/// the local [`SlidingWindowLimiter`](crate::ratelimit::SlidingWindowLimiter),
/// there are no sub-windows, so the two variants can disagree near a window
/// boundary by up to one sub-window.
#[derive(Debug)]
pub struct SharedSlidingWindowLimiter {
    rate: u64,
    window_us: i64,
    key: String,
    clock: Arc<dyn Clock>,
    script: ScriptHandle,
}

impl SharedSlidingWindowLimiter {
    /// Create a limiter on the system clock and register its script.
    pub async fn new(
        config: RateConfig,
        store: Arc<dyn ScriptStore>,
        key: impl Into<String>,
    ) -> Result<Self> {
        Self::with_clock(config, store, key, clock::system()).await
    }

    /// Create a limiter reading time from `clock` and register its script.
    pub async fn with_clock(
        config: RateConfig,
        store: Arc<dyn ScriptStore>,
        key: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate_shared()?;
        let key = validate_key(key.into())?;
        let script = ScriptHandle::register(store, Script::new(SLIDING_WINDOW)).await?;
        debug!(key = %key, rate = config.rate, "Shared sliding window limiter ready");

        Ok(Self {
            rate: config.rate,
            window_us: clock::as_micros(config.duration),
            key,
            clock,
            script,
        })
    }

    /// The store key holding the timestamp set.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl Limiter for SharedSlidingWindowLimiter {
    async fn allow(&self) -> Result<bool> {
        let now = clock::as_micros(self.clock.now());
        let allowed = self
            .script
            .decide(&self.key, &[self.window_us, self.rate as i64, now])
            .await?;

        trace!(key = %self.key, allowed = allowed, "Shared sliding window decision");
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SlidingWindowConfig;
    use crate::error::RateLimitError;
    use crate::ratelimit::SlidingWindowLimiter;
    use crate::store::{MemoryStore, StoreError, StoredValue};
    use std::time::Duration;

    const START: Duration = Duration::from_secs(5_000);

    async fn setup(rate: u64) -> (SharedSlidingWindowLimiter, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(START);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = SharedSlidingWindowLimiter::with_clock(
            RateConfig::new(rate, Duration::from_secs(1)),
            store.clone(),
            "rl:sliding",
            Arc::new(clock.clone()),
        )
        .await
        .unwrap();
        (limiter, store, clock)
    }

    fn members(store: &MemoryStore) -> usize {
        match store.value("rl:sliding") {
            Some(StoredValue::SortedSet(members)) => members.len(),
            None => 0,
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_admits_rate_within_window() {
        let (limiter, store, clock) = setup(4).await;

        for _ in 0..4 {
            assert!(limiter.allow().await.unwrap());
            clock.advance(Duration::from_millis(200));
        }
        assert!(!limiter.allow().await.unwrap());
        assert_eq!(members(&store), 4);
    }

    #[tokio::test]
    async fn test_entries_age_out_individually() {
        let (limiter, _store, clock) = setup(2).await;

        assert!(limiter.allow().await.unwrap());
        clock.advance(Duration::from_millis(500));
        assert!(limiter.allow().await.unwrap());
        assert!(!limiter.allow().await.unwrap());

        // The first entry is exactly one window old and no longer counts
        clock.advance(Duration::from_millis(500));
        assert!(limiter.allow().await.unwrap());
        assert!(!limiter.allow().await.unwrap());
    }

    #[tokio::test]
    async fn test_denial_records_nothing() {
        let (limiter, store, _clock) = setup(1).await;
        assert!(limiter.allow().await.unwrap());

        for _ in 0..3 {
            assert!(!limiter.allow().await.unwrap());
        }
        assert_eq!(members(&store), 1);
    }

    #[tokio::test]
    async fn test_precise_where_local_is_bucketed() {
        let (shared, _store, clock) = setup(4).await;
        let local = SlidingWindowLimiter::with_clock(
            SlidingWindowConfig::new(4, Duration::from_secs(1), 4),
            Arc::new(clock.clone()),
        )
        .unwrap();

        for _ in 0..4 {
            assert!(shared.allow().await.unwrap());
            assert!(local.try_allow());
        }

        // 999ms later the burst is still inside the exact window, but the
        // local ring has already cleared every bucket.
        clock.advance(Duration::from_millis(999));
        assert!(!shared.allow().await.unwrap());
        assert!(local.try_allow());
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let (limiter, store, _clock) = setup(1).await;
        store.set_available(false);
        assert!(matches!(
            limiter.allow().await,
            Err(RateLimitError::Store(StoreError::Unavailable(_)))
        ));
    }
}
