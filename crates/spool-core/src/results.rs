//! Result records keyed by callback id, shared across processes.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::ResultConfig;
use crate::domain::{CallbackId, TaskResult};
use crate::ports::{CoordinationStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ResultError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode task result: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed task result for {callback_id}: {source}")]
    Decode {
        callback_id: CallbackId,
        #[source]
        source: serde_json::Error,
    },

    #[error("no terminal result for {callback_id} within {timeout:?}")]
    Timeout {
        callback_id: CallbackId,
        timeout: Duration,
    },

    #[error("result wait cancelled")]
    Cancelled,
}

pub struct ResultStore {
    store: Arc<dyn CoordinationStore>,
    key_prefix: String,
    ttl: Duration,
}

impl ResultStore {
    pub fn new(store: Arc<dyn CoordinationStore>, key_prefix: &str, config: &ResultConfig) -> Self {
        Self {
            store,
            key_prefix: key_prefix.to_string(),
            ttl: config.ttl(),
        }
    }

    pub fn key(&self, callback_id: CallbackId) -> String {
        format!("{}:result:{callback_id}", self.key_prefix)
    }

    /// Overwrite the record and restart its TTL.
    pub async fn put(&self, record: &TaskResult) -> Result<(), ResultError> {
        let encoded = serde_json::to_string(record).map_err(ResultError::Encode)?;
        self.store
            .set_ex(&self.key(record.callback_id), &encoded, self.ttl)
            .await?;
        debug!(
            task_id = %record.task_id,
            callback_id = %record.callback_id,
            status = %record.status,
            "stored task result"
        );
        Ok(())
    }

    pub async fn get(&self, callback_id: CallbackId) -> Result<Option<TaskResult>, ResultError> {
        let Some(raw) = self.store.get(&self.key(callback_id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| ResultError::Decode {
                callback_id,
                source,
            })
    }

    /// Poll every `poll_interval` until the record is terminal.
    pub async fn wait_for(
        &self,
        callback_id: CallbackId,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, ResultError> {
        let deadline = Instant::now() + timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(ResultError::Cancelled);
            }

            if let Some(record) = self.get(callback_id).await? {
                if record.is_terminal() {
                    return Ok(record);
                }
                trace!(%callback_id, status = %record.status, "result not terminal yet");
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ResultError::Timeout {
                    callback_id,
                    timeout,
                });
            }
            let nap = poll_interval.min(deadline - now);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ResultError::Cancelled),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}
