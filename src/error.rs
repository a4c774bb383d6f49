//! Error types for ratekit.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for ratekit operations.
///
/// A denial is never an error: limiters report it as `Ok(false)`.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// Rejected limiter parameters (zero rate, zero duration, bad sub-window count)
    #[error("Invalid limiter configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared store could not be consulted
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A background refill task was requested outside of a tokio runtime
    #[error("No tokio runtime available to drive the token producer")]
    NoRuntime,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for ratekit operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;
