//! Shared fixed period counter.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::handle::ScriptHandle;
use super::scripts::{Script, FIXED_PERIOD};
use super::validate_key;
use crate::clock::{self, Clock};
use crate::config::RateConfig;
use crate::error::Result;
use crate::ratelimit::backend::Limiter;
use crate::store::ScriptStore;

/// Fixed period counter kept in the store under `key`.
///
/// Each call increments the counter only while it is below `rate`. The first
/// increment of a fresh counter sets its absolute expiry to one window from
/// the call, so the store retires the window by itself.
#[derive(Debug)]
pub struct SharedFixedPeriodLimiter {
    rate: u64,
    duration: Duration,
    key: String,
    clock: Arc<dyn Clock>,
    script: ScriptHandle,
}

impl SharedFixedPeriodLimiter {
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
        let script = ScriptHandle::register(store, Script::new(FIXED_PERIOD)).await?;
        debug!(key = %key, rate = config.rate, "Shared fixed period limiter ready");

        Ok(Self {
            rate: config.rate,
            duration: config.duration,
            key,
            clock,
            script,
        })
    }

    /// The store key holding the counter.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl Limiter for SharedFixedPeriodLimiter {
    async fn allow(&self) -> Result<bool> {
        let expire_at = clock::as_micros(self.clock.now() + self.duration);
        let allowed = self
            .script
            .decide(&self.key, &[expire_at, self.rate as i64])
            .await?;

        trace!(key = %self.key, allowed = allowed, "Shared fixed period decision");
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::RateLimitError;
    use crate::store::{MemoryStore, StoreError, StoredValue};

    async fn setup(rate: u64) -> (SharedFixedPeriodLimiter, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(Duration::from_secs(3_000));
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = SharedFixedPeriodLimiter::with_clock(
            RateConfig::new(rate, Duration::from_secs(1)),
            store.clone(),
            "rl:fixed",
            Arc::new(clock.clone()),
        )
        .await
        .unwrap();
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_admits_rate_then_denies() {
        let (limiter, store, _clock) = setup(5).await;

        for i in 1..=5 {
            assert!(limiter.allow().await.unwrap(), "call {} should be admitted", i);
        }
        assert!(!limiter.allow().await.unwrap());
        assert_eq!(store.value("rl:fixed"), Some(StoredValue::Integer(5)));
    }

    #[tokio::test]
    async fn test_store_expiry_starts_new_window() {
        let (limiter, store, clock) = setup(2).await;

        assert!(limiter.allow().await.unwrap());
        assert!(limiter.allow().await.unwrap());
        assert!(!limiter.allow().await.unwrap());

        clock.advance(Duration::from_millis(1_100));
        assert!(limiter.allow().await.unwrap());
        assert_eq!(store.value("rl:fixed"), Some(StoredValue::Integer(1)));
    }

    #[tokio::test]
    async fn test_expiry_set_once_per_window() {
        let (limiter, store, clock) = setup(3).await;

        assert!(limiter.allow().await.unwrap());
        clock.advance(Duration::from_millis(600));
        assert!(limiter.allow().await.unwrap());

        // The second call must not push the window end out
        assert_eq!(store.ttl("rl:fixed"), Some(Duration::from_millis(400)));
    }

    #[tokio::test]
    async fn test_denial_does_not_touch_counter() {
        let (limiter, store, _clock) = setup(1).await;

        assert!(limiter.allow().await.unwrap());
        for _ in 0..5 {
            assert!(!limiter.allow().await.unwrap());
        }
        assert_eq!(store.value("rl:fixed"), Some(StoredValue::Integer(1)));
    }

    #[tokio::test]
    async fn test_instances_share_one_limit() {
        let (first, store, clock) = setup(4).await;
        let second = SharedFixedPeriodLimiter::with_clock(
            RateConfig::new(4, Duration::from_secs(1)),
            store.clone(),
            "rl:fixed",
            Arc::new(clock.clone()),
        )
        .await
        .unwrap();

        assert!(first.allow().await.unwrap());
        assert!(second.allow().await.unwrap());
        assert!(first.allow().await.unwrap());
        assert!(second.allow().await.unwrap());
        assert!(!first.allow().await.unwrap());
        assert!(!second.allow().await.unwrap());
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let (limiter, store, _clock) = setup(1).await;
        store.set_available(false);

        assert!(matches!(
            limiter.allow().await,
            Err(RateLimitError::Store(StoreError::Unavailable(_)))
        ));

        store.set_available(true);
        assert!(limiter.allow().await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let store = Arc::new(MemoryStore::new());
        let result =
            SharedFixedPeriodLimiter::new(RateConfig::new(1, Duration::from_secs(1)), store, "")
                .await;
        assert!(matches!(result, Err(RateLimitError::InvalidConfig(_))));
    }
}
