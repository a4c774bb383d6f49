//! Shared limiters backed by a script store.
//!
//! Each shared limiter owns one store key and one script. A decision is a
//! single script evaluation, so any number of processes pointed at the same
//! store and key enforce one combined limit.

pub mod scripts;

mod fixed_period;
mod handle;
mod leaky_bucket;
mod sliding_window;
mod token_bucket;

pub use fixed_period::SharedFixedPeriodLimiter;
pub use leaky_bucket::SharedLeakyBucketLimiter;
pub use sliding_window::SharedSlidingWindowLimiter;
pub use token_bucket::SharedTokenBucketLimiter;

use crate::error::{RateLimitError, Result};

pub(crate) fn validate_key(key: String) -> Result<String> {
    if key.is_empty() {
        return Err(RateLimitError::InvalidConfig(
            "shared limiter key must not be empty".to_string(),
        ));
    }
    Ok(key)
}
