//! Ratekit - Rate Limiting Toolkit
//!
//! This crate provides four admission algorithms (fixed period, leaky bucket,
//! sliding window and token bucket), each in two modes. Local limiters keep
//! their state in process behind a lock. Shared limiters keep it in a script
//! store and decide with one atomic script per call, so every process pointed
//! at the same store and key enforces one combined limit.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{RateLimitError, Result};
pub use ratelimit::{BatchLimiter, Limiter, RateLimiter};
