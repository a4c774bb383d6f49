//! Redis implementation of the script store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError};
use tracing::info;

use super::{ScriptStore, StoreError};

type StoreResult<T> = std::result::Result<T, StoreError>;

/// A script store backed by a Redis server.
///
/// Uses `SCRIPT EXISTS`, `SCRIPT LOAD` and `EVALSHA` only; the connection
/// manager reconnects on its own after transient failures.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to the server at `url`, e.g. `redis://127.0.0.1:6379/`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to redis store");
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl ScriptStore for RedisStore {
    async fn script_exists(&self, sha: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let exists: Vec<bool> = redis::cmd("SCRIPT")
            .arg("EXISTS")
            .arg(sha)
            .query_async(&mut conn)
            .await?;
        Ok(exists.first().copied().unwrap_or(false))
    }

    async fn script_load(&self, body: &str) -> StoreResult<String> {
        let mut conn = self.conn.clone();
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(body)
            .query_async(&mut conn)
            .await?;
        Ok(sha)
    }

    async fn eval_sha(&self, sha: &str, keys: &[&str], args: &[i64]) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(sha).arg(keys.len());
        for key in keys {
            cmd.arg(*key);
        }
        for value in args {
            cmd.arg(*value);
        }
        let reply: i64 = cmd.query_async(&mut conn).await?;
        Ok(reply)
    }
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.kind() == ErrorKind::NoScriptError {
            StoreError::NoScript(err.to_string())
        } else if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else if err.kind() == ErrorKind::TypeError {
            StoreError::UnexpectedReply(err.to_string())
        } else {
            StoreError::Script(err.to_string())
        }
    }
}
