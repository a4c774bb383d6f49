//! Limiter traits for abstracting local and shared implementations.

use async_trait::async_trait;

use crate::error::Result;

/// The admission decision every limiter implements.
///
/// `Ok(true)` admits the unit of work and `Ok(false)` denies it. `Err` means
/// the limiter could not be consulted (only shared limiters fail this way);
/// callers must treat it as unknown, never as an implicit allow or deny.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Attempt to admit one unit of work.
    async fn allow(&self) -> Result<bool>;
}

/// Limiters that can admit several units as one all-or-nothing decision.
#[async_trait]
pub trait BatchLimiter: Limiter {
    /// Attempt to admit `n` units at once. Either all `n` are debited or none.
    async fn allow_n(&self, n: u64) -> Result<bool>;
}
