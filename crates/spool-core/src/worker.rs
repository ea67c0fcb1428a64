use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::domain::{CallbackId, Classify, HandlerError, Task, TaskResult, TaskType};
use crate::ports::Clock;
use crate::queue::{PriorityQueue, QueueError};
use crate::rate_limit::{RateLimitError, RateLimiter};
use crate::results::{ResultError, ResultStore};
use crate::runtime::{ExecutorRegistry, RegistryError, TaskContext, TaskHandler};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Result(#[from] ResultError),
}

/// Counters for one pool, since construction.
#[derive(Debug, Default)]
pub struct PoolStats {
    processed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatsSnapshot {
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub requeued: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

/// What happened to one dequeued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    /// Back on the queue; the result record says pending.
    Requeued,
    /// Back on the queue untouched because the limiter gave up. The loop
    /// pauses for the given time before dequeuing again.
    Deferred(Duration),
}

/// Everything the consumer loops share.
struct Shared {
    queue: Arc<PriorityQueue>,
    limiter: Arc<RateLimiter>,
    results: Arc<ResultStore>,
    registry: Arc<ExecutorRegistry>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    stats: PoolStats,
}

/// Running loops.
/// - `cancel` を cancel するとワーカー全体が止まる
/// - `joins` で全ワーカーの終了を待てる
struct Running {
    cancel: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

/// Pool of consumer loops pulling from the shared queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<PriorityQueue>,
        limiter: Arc<RateLimiter>,
        results: Arc<ResultStore>,
        registry: Arc<ExecutorRegistry>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue,
                limiter,
                results,
                registry,
                clock,
                config,
                stats: PoolStats::default(),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn register_executor(
        &self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), WorkerError> {
        self.shared.registry.register(task_type, handler)?;
        Ok(())
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.shared.registry
    }

    pub fn concurrency(&self) -> usize {
        self.shared.config.concurrency
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// False once `stop` ran or the token given to `start` was cancelled.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|r| !r.cancel.is_cancelled())
    }

    /// Spawn `concurrency` consumer loops. They stop when `cancel` (or
    /// [`Self::stop`]) fires.
    ///
    /// A pool whose parent token was cancelled can be started again. Loops
    /// left over from the previous run are still joined by the next `stop`.
    pub fn start(&self, cancel: &CancellationToken) -> Result<(), WorkerError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|r| !r.cancel.is_cancelled()) {
            return Err(WorkerError::AlreadyRunning);
        }

        let cancel = cancel.child_token();
        let n = self.shared.config.concurrency.max(1);
        let mut joins = running.take().map(|r| r.joins).unwrap_or_default();
        joins.reserve(n);
        for worker_id in 0..n {
            let shared = Arc::clone(&self.shared);
            let cancel = cancel.clone();
            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, shared, cancel).await;
            }));
        }
        info!(concurrency = n, queue = %self.shared.queue.key(), "worker pool started");

        *running = Some(Running { cancel, joins });
        Ok(())
    }

    /// Stop taking new tasks and wait for in-flight ones to finish.
    ///
    /// Tasks still on the queue stay there. Stopping an idle pool is a no-op.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(running) = running else {
            return;
        };

        running.cancel.cancel();
        for join in running.joins {
            if let Err(err) = join.await {
                error!(error = %err, "worker loop ended abnormally");
            }
        }
        info!(stats = ?self.stats(), "worker pool stopped");
    }

    pub async fn get_task_result(
        &self,
        callback_id: CallbackId,
    ) -> Result<Option<TaskResult>, WorkerError> {
        Ok(self.shared.results.get(callback_id).await?)
    }

    /// Poll until the task reaches `completed` or `failed`.
    pub async fn wait_for_task_result(
        &self,
        callback_id: CallbackId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, WorkerError> {
        let poll = self.shared.config.result_poll_interval();
        Ok(self
            .shared
            .results
            .wait_for(callback_id, timeout, poll, cancel)
            .await?)
    }
}

async fn worker_loop(worker_id: usize, shared: Arc<Shared>, cancel: CancellationToken) {
    debug!(worker_id, "worker loop started");
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let pause = match shared.queue.dequeue().await {
            Ok(Some(task)) => match shared.process(worker_id, task, &cancel).await {
                Outcome::Deferred(delay) => Some(delay),
                _ => None,
            },
            Ok(None) => Some(shared.config.poll_interval()),
            Err(QueueError::Malformed(err)) => {
                warn!(worker_id, error = %err, "skipped malformed queue entry");
                None
            }
            Err(err) => {
                error!(worker_id, error = %err, "dequeue failed");
                Some(shared.config.poll_interval())
            }
        };

        if let Some(pause) = pause {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
    debug!(worker_id, "worker loop stopped");
}

impl Shared {
    /// Run one dequeued task to a terminal result or back onto the queue.
    async fn process(&self, worker_id: usize, mut task: Task, cancel: &CancellationToken) -> Outcome {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        let record = TaskResult::processing(&task, self.clock.now());
        self.store_result(&record).await;

        // 待機中に止められたら、予算を消費せずにキューへ戻す
        if let Err(err) = self.limiter.wait(cancel).await {
            debug!(worker_id, task_id = %task.id(), error = %err, "rate limit wait aborted, returning task");
            let pause = match err {
                RateLimitError::WaitExhausted { retry_after, .. } => retry_after,
                RateLimitError::Cancelled => Duration::ZERO,
                RateLimitError::Store(_) => self.config.poll_interval(),
            };
            let priority = task.priority();
            return match self.requeue(task, priority, record).await {
                Outcome::Requeued => Outcome::Deferred(pause),
                other => other,
            };
        }

        let Some(handler) = self.registry.get(task.task_type()) else {
            let message = format!("no executor registered for task type {}", task.task_type());
            warn!(worker_id, task_id = %task.id(), "{message}");
            return self.finish_failed(record, message).await;
        };

        let ctx = TaskContext::new(&task, cancel.clone());
        let payload = task.payload().clone();
        let outcome = match tokio::spawn(async move { handler.handle(ctx, payload).await }).await {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_panic() => {
                Err(HandlerError::non_retryable(format!("handler panicked: {join_err}")))
            }
            Err(join_err) => Err(HandlerError::non_retryable(format!("handler aborted: {join_err}"))),
        };

        match outcome {
            Ok(value) => {
                debug!(worker_id, task_id = %task.id(), "task completed");
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                self.store_result(&record.complete(value, self.clock.now())).await;
                Outcome::Completed
            }
            Err(err) if err.is_overload() && task.can_retry() => {
                task.record_retry();
                let degraded = (task.priority() - self.config.priority_step).max(0);
                info!(
                    worker_id,
                    task_id = %task.id(),
                    from = task.priority(),
                    to = degraded,
                    retry_count = task.retry_count(),
                    "overloaded, re-enqueueing with lower priority"
                );
                self.requeue(task, degraded, record).await
            }
            Err(err) => {
                warn!(worker_id, task_id = %task.id(), kind = ?err.kind(), error = %err, "task failed");
                self.finish_failed(record, err.message().to_string()).await
            }
        }
    }

    /// Once the task is back on the queue another worker may finish it at any
    /// moment, so the pending record has to be written before the enqueue.
    async fn requeue(&self, task: Task, priority: i32, record: TaskResult) -> Outcome {
        let pending = record.requeue();
        self.store_result(&pending).await;
        match self.queue.enqueue(task, priority).await {
            Ok(_) => {
                self.stats.requeued.fetch_add(1, Ordering::Relaxed);
                Outcome::Requeued
            }
            Err(err) => {
                error!(task_id = %pending.task_id, error = %err, "re-enqueue failed");
                self.finish_failed(pending, format!("re-enqueue failed: {err}"))
                    .await
            }
        }
    }

    async fn finish_failed(&self, record: TaskResult, message: String) -> Outcome {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        self.store_result(&record.fail(message, self.clock.now())).await;
        Outcome::Failed
    }

    async fn store_result(&self, record: &TaskResult) {
        if let Err(err) = self.results.put(record).await {
            error!(task_id = %record.task_id, status = %record.status, error = %err, "failed to store task result");
        }
    }
}
