//! Shared leaky bucket pacing.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

use super::handle::ScriptHandle;
use super::scripts::{Script, LEAKY_BUCKET};
use super::validate_key;
use crate::clock::{self, Clock};
use crate::config::RateConfig;
use crate::error::Result;
use crate::ratelimit::backend::Limiter;
use crate::store::ScriptStore;

/// Leaky bucket pacing with the last admitted timestamp kept in the store.
///
/// A missing timestamp counts as far in the past. Denials leave the stored
/// timestamp alone.
#[derive(Debug)]
pub struct SharedLeakyBucketLimiter {
    interval_us: i64,
    key: String,
    clock: Arc<dyn Clock>,
    script: ScriptHandle,
}

impl SharedLeakyBucketLimiter {
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
        let script = ScriptHandle::register(store, Script::new(LEAKY_BUCKET)).await?;
        let interval_us = clock::as_micros(config.interval());
        debug!(key = %key, interval_us = interval_us, "Shared leaky bucket limiter ready");

        Ok(Self {
            interval_us,
            key,
            clock,
            script,
        })
    }

    /// The store key holding the last admitted timestamp.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl Limiter for SharedLeakyBucketLimiter {
    async fn allow(&self) -> Result<bool> {
        let now = clock::as_micros(self.clock.now());
        let allowed = self
            .script
            .decide(&self.key, &[self.interval_us, now])
            .await?;

        trace!(key = %self.key, allowed = allowed, "Shared leaky bucket decision");
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::RateLimitError;
    use crate::store::{MemoryStore, StoreError, StoredValue};
    use std::time::Duration;

    const START: Duration = Duration::from_secs(4_000);

    async fn setup() -> (SharedLeakyBucketLimiter, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(START);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = SharedLeakyBucketLimiter::with_clock(
            RateConfig::new(10, Duration::from_secs(1)),
            store.clone(),
            "rl:leaky",
            Arc::new(clock.clone()),
        )
        .await
        .unwrap();
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_first_call_admitted() {
        let (limiter, store, _clock) = setup().await;
        assert!(limiter.allow().await.unwrap());
        assert_eq!(
            store.value("rl:leaky"),
            Some(StoredValue::Integer(START.as_micros() as i64))
        );
    }

    #[tokio::test]
    async fn test_spacing_enforced() {
        let (limiter, _store, clock) = setup().await;
        assert!(limiter.allow().await.unwrap());

        clock.advance(Duration::from_millis(99));
        assert!(!limiter.allow().await.unwrap());

        clock.advance(Duration::from_millis(1));
        assert!(limiter.allow().await.unwrap());
    }

    #[tokio::test]
    async fn test_denial_keeps_timestamp() {
        let (limiter, store, clock) = setup().await;
        assert!(limiter.allow().await.unwrap());
        let admitted = store.value("rl:leaky");

        clock.advance(Duration::from_millis(50));
        assert!(!limiter.allow().await.unwrap());
        assert_eq!(store.value("rl:leaky"), admitted);

        clock.advance(Duration::from_millis(50));
        assert!(limiter.allow().await.unwrap());
    }

    #[tokio::test]
    async fn test_instances_share_spacing() {
        let (first, store, clock) = setup().await;
        let second = SharedLeakyBucketLimiter::with_clock(
            RateConfig::new(10, Duration::from_secs(1)),
            store,
            "rl:leaky",
            Arc::new(clock.clone()),
        )
        .await
        .unwrap();

        assert!(first.allow().await.unwrap());
        assert!(!second.allow().await.unwrap());
        clock.advance(Duration::from_millis(100));
        assert!(second.allow().await.unwrap());
        assert!(!first.allow().await.unwrap());
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let (limiter, store, _clock) = setup().await;
        store.set_available(false);
        assert!(matches!(
            limiter.allow().await,
            Err(RateLimitError::Store(StoreError::Unavailable(_)))
        ));
    }
}
