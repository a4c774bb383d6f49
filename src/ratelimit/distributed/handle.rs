//! Script registration and evaluation on behalf of one shared limiter.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::scripts::Script;
use crate::error::Result;
use crate::store::{ScriptStore, StoreError};

/// A script known to be loaded in a store.
///
/// The mutex only serializes this process's calls through the handle so two
/// threads never race to reload the script. Cross-process correctness rests
/// on the store running each script atomically.
pub(crate) struct ScriptHandle {
    script: Script,
    store: Arc<dyn ScriptStore>,
    lock: Mutex<()>,
}

impl ScriptHandle {
    /// Make sure `script` is loaded in `store`. Failures surface here, not on
    /// the first decision.
    pub(crate) async fn register(store: Arc<dyn ScriptStore>, script: Script) -> Result<Self> {
        ensure_loaded(store.as_ref(), &script).await?;
        Ok(Self {
            script,
            store,
            lock: Mutex::new(()),
        })
    }

    /// Run the script against `key` and read its 1/0 reply as allow/deny.
    pub(crate) async fn decide(&self, key: &str, args: &[i64]) -> Result<bool> {
        match self.eval(key, args).await? {
            1 => Ok(true),
            0 => Ok(false),
            other => Err(StoreError::UnexpectedReply(format!(
                "script {} returned {}",
                self.script.sha(),
                other
            ))
            .into()),
        }
    }

    async fn eval(&self, key: &str, args: &[i64]) -> std::result::Result<i64, StoreError> {
        let _guard = self.lock.lock().await;
        let keys = [key];

        match self.store.eval_sha(self.script.sha(), &keys, args).await {
            Err(StoreError::NoScript(_)) => {
                // The store dropped its script cache; reload and run the same call.
                warn!(sha = %self.script.sha(), "Script missing from store, reloading");
                ensure_loaded(self.store.as_ref(), &self.script).await?;
                self.store.eval_sha(self.script.sha(), &keys, args).await
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Shared limiter store call failed");
                Err(err)
            }
            reply => reply,
        }
    }
}

impl std::fmt::Debug for ScriptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptHandle")
            .field("sha", &self.script.sha())
            .finish_non_exhaustive()
    }
}

async fn ensure_loaded(
    store: &dyn ScriptStore,
    script: &Script,
) -> std::result::Result<(), StoreError> {
    if store.script_exists(script.sha()).await? {
        return Ok(());
    }

    let sha = store.script_load(script.body()).await?;
    if sha != script.sha() {
        return Err(StoreError::UnexpectedReply(format!(
            "store named script {} but expected {}",
            sha,
            script.sha()
        )));
    }
    info!(sha = %sha, "Loaded rate limit script");
    Ok(())
}
