//! Token bucket with a background producer.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace};

use super::backend::{BatchLimiter, Limiter};
use crate::config::RateConfig;
use crate::error::{RateLimitError, Result};

/// Largest reservoir a local token bucket will allocate.
pub const MAX_LOCAL_CAPACITY: u64 = 1 << 20;

/// A reservoir of `rate` tokens refilled one at a time every `duration / rate`.
///
/// The reservoir starts full. A tokio task owned by the limiter adds a token
/// one interval after a slot frees up, so a bucket left full for a long time
/// banks nothing extra. The task is stopped by [`close`] or when
/// the limiter is dropped. Taking a token never waits: an empty reservoir is
/// an immediate denial.
///
/// [`close`]: TokenBucketLimiter::close
#[derive(Debug)]
pub struct TokenBucketLimiter {
    rate: u64,
    interval: Duration,
    tokens: Mutex<mpsc::Receiver<()>>,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl TokenBucketLimiter {
    /// Create a limiter and spawn its producer on the current tokio runtime.
    pub fn new(config: RateConfig) -> Result<Self> {
        config.validate()?;
        if config.rate > MAX_LOCAL_CAPACITY {
            return Err(RateLimitError::InvalidConfig(format!(
                "token bucket rate {} exceeds the local capacity limit of {}",
                config.rate, MAX_LOCAL_CAPACITY
            )));
        }
        let runtime = Handle::try_current().map_err(|_| RateLimitError::NoRuntime)?;

        let capacity = config.rate as usize;
        let (tx, rx) = mpsc::channel(capacity);
        for _ in 0..capacity {
            // Cannot fail: the channel was created with exactly this capacity
            let _ = tx.try_send(());
        }

        let interval = config.interval();
        let producer = runtime.spawn(produce(tx, interval));
        debug!(
            rate = config.rate,
            interval_us = u64::try_from(interval.as_micros()).unwrap_or(u64::MAX),
            "Token bucket producer started"
        );

        Ok(Self {
            rate: config.rate,
            interval,
            tokens: Mutex::new(rx),
            producer: Mutex::new(Some(producer)),
        })
    }

    /// Take one token if one is available.
    pub fn try_allow(&self) -> bool {
        self.try_allow_n(1)
    }

    /// Take `n` tokens if all `n` are available, otherwise take none.
    pub fn try_allow_n(&self, n: u64) -> bool {
        if n == 0 {
            return true;
        }
        if n > self.rate {
            return false;
        }

        let mut tokens = self.tokens.lock();
        // Only the producer adds tokens and only this lock removes them,
        // so the count can grow but not shrink before the loop below runs.
        let available = tokens.len() as u64;
        if available < n {
            trace!(available = available, requested = n, "Token bucket empty");
            return false;
        }
        for _ in 0..n {
            let _ = tokens.try_recv();
        }
        true
    }

    /// Tokens currently in the reservoir.
    pub fn available(&self) -> u64 {
        self.tokens.lock().len() as u64
    }

    /// Refill cadence.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stop the producer. Tokens already in the reservoir can still be taken.
    pub fn close(&self) {
        if let Some(producer) = self.producer.lock().take() {
            producer.abort();
            debug!(rate = self.rate, "Token bucket producer stopped");
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.producer.lock().is_none()
    }
}

impl Drop for TokenBucketLimiter {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.get_mut().take() {
            producer.abort();
        }
    }
}

/// Add one token per interval while the reservoir has room.
///
/// The slot is claimed before the interval starts, so the clock for the next
/// token only runs once a caller has taken one.
async fn produce(tx: mpsc::Sender<()>, interval: Duration) {
    loop {
        let Ok(permit) = tx.reserve().await else {
            break;
        };
        time::sleep(interval).await;
        permit.send(());
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    async fn allow(&self) -> Result<bool> {
        Ok(self.try_allow())
    }
}

#[async_trait]
impl BatchLimiter for TokenBucketLimiter {
    async fn allow_n(&self, n: u64) -> Result<bool> {
        Ok(self.try_allow_n(n))
    }
}
