//! Shared token bucket with lazy refill.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

use super::handle::ScriptHandle;
use super::scripts::{Script, TOKEN_BUCKET};
use super::validate_key;
use crate::clock::{self, Clock};
use crate::config::RateConfig;
use crate::error::Result;
use crate::ratelimit::backend::{BatchLimiter, Limiter};
use crate::store::ScriptStore;

/// Token bucket whose state is a `(timestamp, tokens)` hash in the store.
///
/// There is no producer: each call credits `elapsed / interval` tokens since
/// the stored timestamp, caps the balance at `rate`, and commits the new
/// timestamp and balance only when the request can be paid in full.
#[derive(Debug)]
pub struct SharedTokenBucketLimiter {
    rate: u64,
    window_us: i64,
    key: String,
    clock: Arc<dyn Clock>,
    script: ScriptHandle,
}

impl SharedTokenBucketLimiter {
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
        let script = ScriptHandle::register(store, Script::new(TOKEN_BUCKET)).await?;
        debug!(key = %key, rate = config.rate, "Shared token bucket limiter ready");

        Ok(Self {
            rate: config.rate,
            window_us: clock::as_micros(config.duration),
            key,
            clock,
            script,
        })
    }

    /// The store key holding the bucket hash.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl Limiter for SharedTokenBucketLimiter {
    async fn allow(&self) -> Result<bool> {
        self.allow_n(1).await
    }
}

#[async_trait]
impl BatchLimiter for SharedTokenBucketLimiter {
    async fn allow_n(&self, n: u64) -> Result<bool> {
        if n == 0 {
            return Ok(true);
        }
        if n > self.rate {
            return Ok(false);
        }

        let now = clock::as_micros(self.clock.now());
        let allowed = self
            .script
            .decide(
                &self.key,
                &[self.window_us, self.rate as i64, now, n as i64],
            )
            .await?;

        trace!(key = %self.key, requested = n, allowed = allowed, "Shared token bucket decision");
        Ok(allowed)
    }
}
