//! The shared store contract.
//!
//! Shared limiters touch the store in exactly two ways: an idempotent
//! script registration when they are built, and one atomic script
//! evaluation per decision. Any store that can do both can back them.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::{MemoryStore, StoredValue};
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{RateLimitError, Result};

/// Failures talking to the shared store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store does not know the requested script digest
    #[error("script not loaded: {0}")]
    NoScript(String),

    /// The script ran and raised an error
    #[error("script failed: {0}")]
    Script(String),

    /// The store answered with something the caller did not expect
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// A store that runs named scripts atomically.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Whether a script with this SHA-1 digest is loaded.
    async fn script_exists(&self, sha: &str) -> std::result::Result<bool, StoreError>;

    /// Load a script body and return its SHA-1 digest. Loading twice is harmless.
    async fn script_load(&self, body: &str) -> std::result::Result<String, StoreError>;

    /// Run a loaded script with the given keys and integer arguments.
    ///
    /// The whole script runs without interleaving with any other caller.
    async fn eval_sha(
        &self,
        sha: &str,
        keys: &[&str],
        args: &[i64],
    ) -> std::result::Result<i64, StoreError>;
}

/// Open the store described by `config`.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn ScriptStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let url = config.url.as_deref().ok_or_else(|| {
                RateLimitError::Config("redis store requires a url".to_string())
            })?;
            Ok(Arc::new(RedisStore::connect(url).await?))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => Err(RateLimitError::Config(
            "redis store support was not compiled in (enable the `redis` feature)".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory() {
        let store = connect(&StoreConfig::default()).await.unwrap();
        assert!(!store.script_exists("0000").await.unwrap());
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn test_connect_redis_without_feature() {
        let config = StoreConfig {
            backend: StoreBackend::Redis,
            url: Some("redis://127.0.0.1/".to_string()),
        };
        assert!(matches!(
            connect(&config).await,
            Err(RateLimitError::Config(_))
        ));
    }
}
