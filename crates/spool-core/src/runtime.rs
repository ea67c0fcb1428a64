use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::domain::{CallbackId, HandlerError, Task, TaskId, TaskType};

/// What a handler gets to know about the task it runs.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub callback_id: CallbackId,
    pub task_type: TaskType,
    /// Overload re-enqueues so far.
    pub retry_count: u32,
    /// Fires when the pool stops or its parent token is cancelled.
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(task: &Task, cancel: CancellationToken) -> Self {
        Self {
            task_id: task.id(),
            callback_id: task.callback_id(),
            task_type: task.task_type().clone(),
            retry_count: task.retry_count(),
            cancel,
        }
    }
}

/// A handler for a specific task type.
///
/// The payload is handed over as-is; decoding it is the handler's business.
/// Long-running handlers should watch `ctx.cancel`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext, payload: Value) -> Result<Value, HandlerError>;
}

/// Adapter so plain async closures can be registered.
pub struct HandlerFn<F>(F);

/// Wrap an async closure as a [`TaskHandler`].
///
/// ```ignore
/// registry.register("echo", handler_fn(|_ctx, payload| async move { Ok(payload) }))?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

#[async_trait]
impl<F, Fut> TaskHandler for HandlerFn<F>
where
    F: Fn(TaskContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, ctx: TaskContext, payload: Value) -> Result<Value, HandlerError> {
        (self.0)(ctx, payload).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate handler for task_type={0}")]
    AlreadyRegistered(TaskType),
}

/// Registry of handlers (task_type -> handler).
///
/// Handlers can be added while workers are running, so lookups go through a
/// lock. The lock is never held across an await.
#[derive(Default)]
pub struct ExecutorRegistry {
    handlers: RwLock<HashMap<TaskType, Arc<dyn TaskHandler>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task type. A second handler for the same type
    /// is rejected rather than silently replacing the first.
    pub fn register(
        &self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        let task_type = task_type.into();
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_type)
            .cloned()
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct OkHandler;

    #[async_trait]
    impl TaskHandler for OkHandler {
        async fn handle(&self, ctx: TaskContext, payload: Value) -> Result<Value, HandlerError> {
            Ok(json!({ "seen": payload, "type": ctx.task_type.as_str() }))
        }
    }

    fn ctx_for(task_type: &str) -> TaskContext {
        TaskContext::new(&Task::new(task_type, json!({})), CancellationToken::new())
    }

    #[tokio::test]
    async fn registry_returns_registered_handler() {
        let reg = ExecutorRegistry::new();
        reg.register("ok", Arc::new(OkHandler)).unwrap();

        let handler = reg.get(&TaskType::new("ok")).unwrap();
        let out = handler.handle(ctx_for("ok"), json!(1)).await.unwrap();
        assert_eq!(out, json!({ "seen": 1, "type": "ok" }));
    }

    #[test]
    fn registry_rejects_duplicate_task_type() {
        let reg = ExecutorRegistry::new();
        reg.register("ok", Arc::new(OkHandler)).unwrap();

        let err = reg.register("ok", Arc::new(OkHandler)).unwrap_err();
        assert!(err.to_string().contains("duplicate handler"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn missing_handler_is_none() {
        let reg = ExecutorRegistry::new();
        assert!(reg.is_empty());
        assert!(reg.get(&TaskType::new("missing")).is_none());
    }

    #[tokio::test]
    async fn closures_register_through_handler_fn() {
        let reg = ExecutorRegistry::new();
        reg.register(
            "fail",
            handler_fn(|_ctx, _payload| async { Err(HandlerError::overload("429")) }),
        )
        .unwrap();
        reg.register("echo", handler_fn(|_ctx, payload| async move { Ok(payload) }))
            .unwrap();

        assert_eq!(
            reg.task_types(),
            vec![TaskType::new("echo"), TaskType::new("fail")]
        );
        let err = reg
            .get(&TaskType::new("fail"))
            .unwrap()
            .handle(ctx_for("fail"), json!({}))
            .await
            .unwrap_err();
        assert!(err.is_overload());
    }

    #[tokio::test]
    async fn context_carries_task_identity_and_cancellation() {
        let task = Task::builder("watch").max_retries(2).build();
        let cancel = CancellationToken::new();
        let ctx = TaskContext::new(&task, cancel.child_token());
        assert_eq!(ctx.task_id, task.id());
        assert_eq!(ctx.callback_id, task.callback_id());
        assert_eq!(ctx.retry_count, 0);

        let handler = handler_fn(|ctx: TaskContext, _payload| async move {
            ctx.cancel.cancelled().await;
            Err(HandlerError::generic("stopped"))
        });
        cancel.cancel();

        let err = handler.handle(ctx, json!(null)).await.unwrap_err();
        assert_eq!(err.message(), "stopped");
    }
}
