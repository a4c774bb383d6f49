//! Rate limiting algorithms and the limiter facade.

mod backend;
mod fixed_period;
mod leaky_bucket;
mod limiter;
mod sliding_window;
mod token_bucket;

pub mod distributed;

pub use backend::{BatchLimiter, Limiter};
pub use distributed::{
    SharedFixedPeriodLimiter, SharedLeakyBucketLimiter, SharedSlidingWindowLimiter,
    SharedTokenBucketLimiter,
};
pub use fixed_period::FixedPeriodLimiter;
pub use leaky_bucket::LeakyBucketLimiter;
pub use limiter::RateLimiter;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::{TokenBucketLimiter, MAX_LOCAL_CAPACITY};
