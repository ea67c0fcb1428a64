//! Shared priority queue on top of the coordination store's ordered set.
//!
//! Each entry is a JSON-serialized [`Task`] scored by its priority. `dequeue`
//! is a single atomic pop-max, so two workers never receive the same entry.
//! Within one priority band the order is whatever the store picks.
//!
//! A blocking pop runs on its own task. If the caller cancels while the pop is
//! in flight, the store may still hand out an entry afterwards; that entry is
//! put back with its original score rather than dropped.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::domain::{CallbackId, Task};
use crate::ports::{Clock, CoordinationStore, ScoredMember, StoreError};

type InFlightPop = JoinHandle<Result<Option<ScoredMember>, StoreError>>;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode task: {0}")]
    Encode(#[source] serde_json::Error),

    /// The entry was already removed from the queue and moved to dead letters.
    #[error("malformed queue entry moved to dead letters: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("no task arrived within {0:?}")]
    Timeout(Duration),

    #[error("dequeue cancelled")]
    Cancelled,
}

/// Snapshot for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub size: u64,
    pub dead_letters: u64,
}

pub struct PriorityQueue {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    key: String,
    dead_key: String,
}

impl PriorityQueue {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        key_prefix: &str,
        config: &QueueConfig,
    ) -> Self {
        let key = format!("{key_prefix}:{}", config.name);
        let dead_key = format!("{key}:dead");
        Self {
            store,
            clock,
            key,
            dead_key,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Clamp `priority`, stamp it on the task and publish it.
    ///
    /// Returns the callback id producers wait on.
    pub async fn enqueue(&self, mut task: Task, priority: i32) -> Result<CallbackId, QueueError> {
        task.set_priority(priority);
        let encoded = serde_json::to_string(&task).map_err(QueueError::Encode)?;
        self.store
            .zadd(&self.key, f64::from(task.priority()), &encoded)
            .await?;
        debug!(
            task_id = %task.id(),
            task_type = %task.task_type(),
            priority = task.priority(),
            retry_count = task.retry_count(),
            "enqueued task"
        );
        Ok(task.callback_id())
    }

    /// Take the highest-priority task, or `Ok(None)` right away if empty.
    pub async fn dequeue(&self) -> Result<Option<Task>, QueueError> {
        match self.store.zpop_max(&self.key).await? {
            Some(entry) => self.decode_popped(entry.member).await.map(Some),
            None => Ok(None),
        }
    }

    /// Wait up to `timeout` for a task to show up.
    pub async fn dequeue_blocking(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Task, QueueError> {
        if cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }

        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let mut pop: InFlightPop = tokio::spawn(async move { store.bzpop_max(&key, timeout).await });

        let popped = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.put_back_late_pop(pop);
                return Err(QueueError::Cancelled);
            }
            joined = &mut pop => joined
                .map_err(|err| StoreError::Backend(format!("blocking pop task failed: {err}")))??,
        };
        match popped {
            Some(entry) => self.decode_popped(entry.member).await,
            None => Err(QueueError::Timeout(timeout)),
        }
    }

    /// Highest-priority task without removing it.
    pub async fn peek(&self) -> Result<Option<Task>, QueueError> {
        match self.store.zpeek_max(&self.key).await? {
            Some(entry) => serde_json::from_str(&entry.member)
                .map(Some)
                .map_err(QueueError::Malformed),
            None => Ok(None),
        }
    }

    pub async fn size(&self) -> Result<u64, QueueError> {
        Ok(self.store.zcard(&self.key).await?)
    }

    /// Drop every queued task. Dead letters are kept.
    pub async fn clear(&self) -> Result<(), QueueError> {
        self.store.delete(&self.key).await?;
        Ok(())
    }

    /// Raw entries that failed to decode, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<String>, QueueError> {
        let entries = self.store.zrange_all(&self.dead_key).await?;
        Ok(entries.into_iter().map(|e| e.member).collect())
    }

    pub async fn dead_letter_count(&self) -> Result<u64, QueueError> {
        Ok(self.store.zcard(&self.dead_key).await?)
    }

    pub async fn clear_dead_letters(&self) -> Result<(), QueueError> {
        self.store.delete(&self.dead_key).await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            size: self.size().await?,
            dead_letters: self.dead_letter_count().await?,
        })
    }

    /// Let an abandoned blocking pop finish and re-insert whatever it took.
    fn put_back_late_pop(&self, pop: InFlightPop) {
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        tokio::spawn(async move {
            let Ok(Ok(Some(entry))) = pop.await else {
                return;
            };
            match store.zadd(&key, entry.score, &entry.member).await {
                Ok(()) => debug!(queue = %key, "re-inserted entry popped after cancellation"),
                Err(err) => {
                    warn!(queue = %key, error = %err, "failed to re-insert entry popped after cancellation")
                }
            }
        });
    }

    /// The entry is already off the queue; a decode failure parks it in the
    /// dead-letter set instead of looping on it.
    async fn decode_popped(&self, raw: String) -> Result<Task, QueueError> {
        match serde_json::from_str::<Task>(&raw) {
            Ok(task) => {
                debug!(task_id = %task.id(), priority = task.priority(), "dequeued task");
                Ok(task)
            }
            Err(err) => {
                warn!(queue = %self.key, error = %err, "dropping malformed queue entry");
                let dropped_at = self.clock.now_millis() as f64;
                if let Err(store_err) = self.store.zadd(&self.dead_key, dropped_at, &raw).await {
                    warn!(queue = %self.key, error = %store_err, "failed to record dead letter");
                }
                Err(QueueError::Malformed(err))
            }
        }
    }
}
