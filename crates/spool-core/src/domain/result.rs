//! Task result record: the outcome waiters poll for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CallbackId, Task, TaskId, TaskStatus};

/// Outcome record stored under the task's callback id.
///
/// Design:
/// - Created as `Processing` when a worker picks the task up.
/// - `result` is present only when `Completed`, `error` only when `Failed`.
/// - `completed_at` is set only on terminal transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub callback_id: CallbackId,
    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    /// Fresh record for a task a worker just dequeued.
    pub fn processing(task: &Task, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id(),
            callback_id: task.callback_id(),
            status: TaskStatus::Processing,
            result: None,
            error: None,
            created_at: now,
            completed_at: None,
        }
    }

    /// Back to pending after an overload re-enqueue.
    pub fn requeue(mut self) -> Self {
        self.status = TaskStatus::Pending;
        self.result = None;
        self.error = None;
        self.completed_at = None;
        self
    }

    pub fn complete(mut self, result: serde_json::Value, now: DateTime<Utc>) -> Self {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
        self
    }

    pub fn fail(mut self, error: impl Into<String>, now: DateTime<Utc>) -> Self {
        self.status = TaskStatus::Failed;
        self.result = None;
        self.error = Some(error.into());
        self.completed_at = Some(now);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
