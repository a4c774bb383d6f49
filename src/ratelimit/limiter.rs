//! The closed family of limiters behind one type.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::backend::{BatchLimiter, Limiter};
use super::distributed::{
    SharedFixedPeriodLimiter, SharedLeakyBucketLimiter, SharedSlidingWindowLimiter,
    SharedTokenBucketLimiter,
};
use super::fixed_period::FixedPeriodLimiter;
use super::leaky_bucket::LeakyBucketLimiter;
use super::sliding_window::SlidingWindowLimiter;
use super::token_bucket::TokenBucketLimiter;
use crate::clock::{self, Clock};
use crate::config::{Algorithm, LimiterSpec, Mode};
use crate::error::{RateLimitError, Result};
use crate::store::ScriptStore;

/// Any of the eight limiters, chosen when it is built.
///
/// Callers that only need decisions can hold a `RateLimiter` and call
/// [`Limiter::allow`] without caring which algorithm or mode is behind it.
#[derive(Debug)]
pub enum RateLimiter {
    FixedPeriod(FixedPeriodLimiter),
    LeakyBucket(LeakyBucketLimiter),
    SlidingWindow(SlidingWindowLimiter),
    TokenBucket(TokenBucketLimiter),
    SharedFixedPeriod(SharedFixedPeriodLimiter),
    SharedLeakyBucket(SharedLeakyBucketLimiter),
    SharedSlidingWindow(SharedSlidingWindowLimiter),
    SharedTokenBucket(SharedTokenBucketLimiter),
}

impl RateLimiter {
    /// Build the limiter a spec describes on the system clock.
    ///
    /// Shared specs need a `store`; local specs ignore it. A local token
    /// bucket must be built inside a tokio runtime.
    pub async fn from_spec(
        spec: &LimiterSpec,
        store: Option<Arc<dyn ScriptStore>>,
    ) -> Result<Self> {
        Self::from_spec_with_clock(spec, store, clock::system()).await
    }

    /// Build the limiter a spec describes, reading time from `clock`.
    ///
    /// The local token bucket refills on tokio time and does not use `clock`.
    pub async fn from_spec_with_clock(
        spec: &LimiterSpec,
        store: Option<Arc<dyn ScriptStore>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let limiter = match spec.mode {
            Mode::Local => match spec.algorithm {
                Algorithm::FixedPeriod => RateLimiter::FixedPeriod(
                    FixedPeriodLimiter::with_clock(spec.rate_config(), clock)?,
                ),
                Algorithm::LeakyBucket => RateLimiter::LeakyBucket(
                    LeakyBucketLimiter::with_clock(spec.rate_config(), clock)?,
                ),
                Algorithm::SlidingWindow => RateLimiter::SlidingWindow(
                    SlidingWindowLimiter::with_clock(spec.sliding_window_config()?, clock)?,
                ),
                Algorithm::TokenBucket => {
                    RateLimiter::TokenBucket(TokenBucketLimiter::new(spec.rate_config())?)
                }
            },
            Mode::Shared => {
                let store = store.ok_or_else(|| {
                    RateLimitError::InvalidConfig(format!(
                        "limiter '{}' is shared but no store was given",
                        spec.name
                    ))
                })?;
                let key = spec.store_key().to_string();
                let config = spec.rate_config();

                match spec.algorithm {
                    Algorithm::FixedPeriod => RateLimiter::SharedFixedPeriod(
                        SharedFixedPeriodLimiter::with_clock(config, store, key, clock).await?,
                    ),
                    Algorithm::LeakyBucket => RateLimiter::SharedLeakyBucket(
                        SharedLeakyBucketLimiter::with_clock(config, store, key, clock).await?,
                    ),
                    Algorithm::SlidingWindow => RateLimiter::SharedSlidingWindow(
                        SharedSlidingWindowLimiter::with_clock(config, store, key, clock).await?,
                    ),
                    Algorithm::TokenBucket => RateLimiter::SharedTokenBucket(
                        SharedTokenBucketLimiter::with_clock(config, store, key, clock).await?,
                    ),
                }
            }
        };

        debug!(
            name = %spec.name,
            algorithm = %spec.algorithm,
            mode = ?spec.mode,
            rate = spec.rate,
            duration_ms = spec.duration_ms,
            "Limiter built"
        );
        Ok(limiter)
    }

    /// The algorithm this limiter runs.
    pub fn algorithm(&self) -> Algorithm {
        match self {
            RateLimiter::FixedPeriod(_) | RateLimiter::SharedFixedPeriod(_) => {
                Algorithm::FixedPeriod
            }
            RateLimiter::LeakyBucket(_) | RateLimiter::SharedLeakyBucket(_) => {
                Algorithm::LeakyBucket
            }
            RateLimiter::SlidingWindow(_) | RateLimiter::SharedSlidingWindow(_) => {
                Algorithm::SlidingWindow
            }
            RateLimiter::TokenBucket(_) | RateLimiter::SharedTokenBucket(_) => {
                Algorithm::TokenBucket
            }
        }
    }

    /// Where this limiter keeps its state.
    pub fn mode(&self) -> Mode {
        match self {
            RateLimiter::FixedPeriod(_)
            | RateLimiter::LeakyBucket(_)
            | RateLimiter::SlidingWindow(_)
            | RateLimiter::TokenBucket(_) => Mode::Local,
            _ => Mode::Shared,
        }
    }

    /// Whether decisions go through the shared store.
    pub fn is_shared(&self) -> bool {
        self.mode() == Mode::Shared
    }

    /// The multi-unit interface, for the variants that have one.
    pub fn as_batch(&self) -> Option<&dyn BatchLimiter> {
        match self {
            RateLimiter::TokenBucket(limiter) => Some(limiter as &dyn BatchLimiter),
            RateLimiter::SharedTokenBucket(limiter) => Some(limiter as &dyn BatchLimiter),
            _ => None,
        }
    }
}

#[async_trait]
impl Limiter for RateLimiter {
    async fn allow(&self) -> Result<bool> {
        match self {
            RateLimiter::FixedPeriod(limiter) => limiter.allow().await,
            RateLimiter::LeakyBucket(limiter) => limiter.allow().await,
            RateLimiter::SlidingWindow(limiter) => limiter.allow().await,
            RateLimiter::TokenBucket(limiter) => limiter.allow().await,
            RateLimiter::SharedFixedPeriod(limiter) => limiter.allow().await,
            RateLimiter::SharedLeakyBucket(limiter) => limiter.allow().await,
            RateLimiter::SharedSlidingWindow(limiter) => limiter.allow().await,
            RateLimiter::SharedTokenBucket(limiter) => limiter.allow().await,
        }
    }
}
