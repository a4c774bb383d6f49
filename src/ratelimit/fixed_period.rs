//! Fixed period counter.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::Limiter;
use crate::clock::{self, Clock};
use crate::config::RateConfig;
use crate::error::Result;

/// Counts calls in a window that restarts at the first call after it expires.
///
/// Windows drift: a new window starts at the call that observed the expiry,
/// not at a calendar boundary. Up to `2 * rate` calls can land in a short
/// span straddling two windows.
#[derive(Debug)]
pub struct FixedPeriodLimiter {
    rate: u64,
    duration: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<FixedPeriodState>,
}

#[derive(Debug)]
struct FixedPeriodState {
    /// Calls admitted in the current window
    count: u64,
    /// End of the current window
    expired_at: Duration,
}

impl FixedPeriodLimiter {
    /// Create a limiter on the system clock.
    pub fn new(config: RateConfig) -> Result<Self> {
        Self::with_clock(config, clock::system())
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(config: RateConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let expired_at = clock.now() + config.duration;

        Ok(Self {
            rate: config.rate,
            duration: config.duration,
            clock,
            state: Mutex::new(FixedPeriodState {
                count: 0,
                expired_at,
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

        if now > state.expired_at {
            state.count = 0;
            state.expired_at = now + self.duration;
            debug!(rate = self.rate, "Fixed period window reset");
        }

        if state.count >= self.rate {
            trace!(count = state.count, rate = self.rate, "Fixed period limit reached");
            return false;
        }
        state.count += 1;
        true
    }

    /// Calls admitted in the current window.
    pub fn count(&self) -> u64 {
        self.state.lock().count
    }

    /// The configured rate.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// The configured window length.
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

#[async_trait]
impl Limiter for FixedPeriodLimiter {
    async fn allow(&self) -> Result<bool> {
        Ok(self.try_allow())
    }
}
