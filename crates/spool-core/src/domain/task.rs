use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{CallbackId, TaskId};

/// Lowest schedulable priority.
pub const MIN_PRIORITY: i32 = 0;
/// Highest schedulable priority.
pub const MAX_PRIORITY: i32 = 1000;
/// Priority used when the producer does not pick one.
pub const DEFAULT_PRIORITY: i32 = 500;
/// Retry budget used when the producer does not pick one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Clamp any requested priority into `[MIN_PRIORITY, MAX_PRIORITY]`.
pub fn clamp_priority(priority: i32) -> i32 {
    priority.clamp(MIN_PRIORITY, MAX_PRIORITY)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A unit of work travelling through the shared queue.
///
/// Identity (`id`, `callback_id`, `task_type`, `payload`, `created_at`) is
/// fixed at creation. Only the queue and the worker pool touch `priority` and
/// `retry_count`, through the crate-private mutators below.
///
/// Invariant: `retry_count <= max_retries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    task_type: TaskType,
    priority: i32,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    max_retries: u32,
    retry_count: u32,
    callback_id: CallbackId,
}

impl Task {
    pub fn new(task_type: impl Into<TaskType>, payload: serde_json::Value) -> Self {
        Self::builder(task_type).payload(payload).build()
    }

    pub fn builder(task_type: impl Into<TaskType>) -> TaskBuilder {
        TaskBuilder::new(task_type.into())
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn callback_id(&self) -> CallbackId {
        self.callback_id
    }

    /// Whether another re-enqueue is still inside the retry budget.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub(crate) fn set_priority(&mut self, priority: i32) {
        self.priority = clamp_priority(priority);
    }

    /// Consume one unit of retry budget. Returns `false` (and changes
    /// nothing) once the budget is spent.
    pub(crate) fn record_retry(&mut self) -> bool {
        if !self.can_retry() {
            return false;
        }
        self.retry_count += 1;
        true
    }
}

/// Builder for [`Task`].
///
/// ```ignore
/// let task = Task::builder("device.sync")
///     .payload(json!({ "device": "abc" }))
///     .max_retries(5)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    task_type: TaskType,
    payload: serde_json::Value,
    priority: i32,
    max_retries: u32,
}

impl TaskBuilder {
    fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            payload: serde_json::Value::Null,
            priority: DEFAULT_PRIORITY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Serialize any value into the opaque payload.
    pub fn payload_json<P: Serialize>(mut self, payload: &P) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Initial priority; `PriorityQueue::enqueue` overrides it anyway.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = clamp_priority(priority);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn build(self) -> Task {
        Task {
            id: TaskId::generate(),
            task_type: self.task_type,
            priority: self.priority,
            payload: self.payload,
            created_at: Utc::now(),
            max_retries: self.max_retries,
            retry_count: 0,
            callback_id: CallbackId::generate(),
        }
    }
}
