//! SpoolBuilder - コンポーネントの構築とワイヤリング
//!
//! Wires queue, rate limiter, retry coordinator, result store and worker pool
//! onto one coordination store, and checks at build time that every expected
//! task type has a handler.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ConfigError, SpoolConfig};
use crate::domain::{CallbackId, Task, TaskResult, TaskType};
use crate::error::SpoolError;
use crate::ports::{Clock, CoordinationStore, SystemClock};
use crate::queue::{PriorityQueue, QueueStats};
use crate::rate_limit::RateLimiter;
use crate::results::ResultStore;
use crate::retry::RetryCoordinator;
use crate::runtime::{ExecutorRegistry, RegistryError, TaskHandler};
use crate::worker::{PoolStatsSnapshot, WorkerPool};

/// SpoolBuilder は Spool を構築
///
/// # 使用例
/// ```ignore
/// let spool = SpoolBuilder::new(store)
///     .config(config)
///     .register("device.sync", handler_fn(sync_device))?
///     .expect_tasks(&["device.sync"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_tasks() で期待される task_type を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
pub struct SpoolBuilder {
    store: Arc<dyn CoordinationStore>,
    config: SpoolConfig,
    clock: Arc<dyn Clock>,
    registry: ExecutorRegistry,
    expected_tasks: Option<Vec<String>>,
}

/// BuildError は構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SpoolBuilder {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            config: SpoolConfig::default(),
            clock: Arc::new(SystemClock),
            registry: ExecutorRegistry::new(),
            expected_tasks: None,
        }
    }

    pub fn config(mut self, config: SpoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used for rate-limit scoring, dead-letter scores and result
    /// timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn register(
        self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(task_type, handler)?;
        Ok(self)
    }

    /// 期待される task_type のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Spool, BuildError> {
        self.config.validate()?;

        if let Some(expected_tasks) = &self.expected_tasks {
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|t| !self.registry.contains(&TaskType::new(t.as_str())))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let prefix = self.config.key_prefix.as_str();
        let queue = Arc::new(PriorityQueue::new(
            self.store.clone(),
            self.clock.clone(),
            prefix,
            &self.config.queue,
        ));
        let limiter = Arc::new(RateLimiter::new(
            self.store.clone(),
            self.clock.clone(),
            prefix,
            &self.config.rate_limit,
        ));
        let retry = Arc::new(RetryCoordinator::new(self.store.clone(), prefix, &self.config.retry));
        let results = Arc::new(ResultStore::new(self.store.clone(), prefix, &self.config.results));
        let pool = WorkerPool::new(
            queue.clone(),
            limiter.clone(),
            results.clone(),
            Arc::new(self.registry),
            self.clock,
            self.config.worker.clone(),
        );

        Ok(Spool {
            config: self.config,
            queue,
            limiter,
            retry,
            results,
            pool,
        })
    }
}

/// Spool は構築済みのコンポーネント一式
pub struct Spool {
    config: SpoolConfig,
    queue: Arc<PriorityQueue>,
    limiter: Arc<RateLimiter>,
    retry: Arc<RetryCoordinator>,
    results: Arc<ResultStore>,
    pool: WorkerPool,
}

impl Spool {
    pub fn config(&self) -> &SpoolConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn retry(&self) -> &Arc<RetryCoordinator> {
        &self.retry
    }

    pub fn results(&self) -> &Arc<ResultStore> {
        &self.results
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Enqueue `task` at `priority` and return its callback id.
    pub async fn submit(&self, task: Task, priority: i32) -> Result<CallbackId, SpoolError> {
        Ok(self.queue.enqueue(task, priority).await?)
    }

    pub fn start(&self, cancel: &CancellationToken) -> Result<(), SpoolError> {
        self.pool.start(cancel)?;
        info!(key_prefix = %self.config.key_prefix, "spool started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.pool.stop().await;
    }

    pub async fn wait_for_result(
        &self,
        callback_id: CallbackId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, SpoolError> {
        Ok(self
            .pool
            .wait_for_task_result(callback_id, timeout, cancel)
            .await?)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, SpoolError> {
        Ok(self.queue.stats().await?)
    }

    pub fn pool_stats(&self) -> PoolStatsSnapshot {
        self.pool.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HandlerError, TaskStatus};
    use crate::impls::InMemoryStore;
    use crate::runtime::{TaskContext, handler_fn};
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn store() -> Arc<dyn CoordinationStore> {
        Arc::new(InMemoryStore::new())
    }

    #[test]
    fn test_build_success() {
        let spool = SpoolBuilder::new(store())
            .register("echo", handler_fn(|_ctx, p| async move { Ok(p) }))
            .unwrap()
            .expect_tasks(&["echo"])
            .build();
        assert!(spool.is_ok());
    }

    #[test]
    fn test_build_missing_task_types() {
        let spool = SpoolBuilder::new(store())
            .register("echo", handler_fn(|_ctx, p| async move { Ok(p) }))
            .unwrap()
            .expect_tasks(&["echo", "resize"])
            .build();
        assert!(matches!(
            spool,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec!["resize".to_string()]
        ));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = SpoolConfig::default();
        config.worker.concurrency = 0;

        let spool = SpoolBuilder::new(store()).config(config).build();
        assert!(matches!(spool, Err(BuildError::Config(_))));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let result = SpoolBuilder::new(store())
            .register("echo", handler_fn(|_ctx, p| async move { Ok(p) }))
            .unwrap()
            .register("echo", handler_fn(|_ctx, p| async move { Ok(p) }));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_submit_and_wait_with_retrying_handler() {
        let retry_store = store();
        let retry = Arc::new(RetryCoordinator::new(
            retry_store,
            "test",
            &crate::config::RetryConfig {
                base_delay_ms: 5,
                jitter_ratio: 0.0,
                ..Default::default()
            },
        ));
        let calls = Arc::new(AtomicU32::new(0));

        let handler = handler_fn({
            let retry = retry.clone();
            let calls = calls.clone();
            move |ctx: TaskContext, payload: Value| {
                let retry = retry.clone();
                let calls = calls.clone();
                async move {
                    retry
                        .execute(&ctx.cancel, "upstream", || {
                            let calls = calls.clone();
                            let payload = payload.clone();
                            async move {
                                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                                    Err(HandlerError::retryable("first call flakes"))
                                } else {
                                    Ok(payload)
                                }
                            }
                        })
                        .await
                        .map_err(|e| match e.into_inner() {
                            Some(err) => err,
                            None => HandlerError::generic("cancelled"),
                        })
                }
            }
        });

        let spool = SpoolBuilder::new(store())
            .register("fetch", handler)
            .unwrap()
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        spool.start(&cancel).unwrap();

        let callback = spool
            .submit(Task::new("fetch", json!({ "url": "x" })), 600)
            .await
            .unwrap();
        let record = spool
            .wait_for_result(callback, Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        spool.shutdown().await;

        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(json!({ "url": "x" })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(retry.retry_count("upstream").await.unwrap(), 1);
        assert_eq!(spool.queue_stats().await.unwrap(), QueueStats::default());
        assert_eq!(spool.pool_stats().completed, 1);
    }
}
