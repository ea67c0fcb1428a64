//! Result status state machine.

use serde::{Deserialize, Serialize};

/// Status of a task as seen through its result record.
///
/// State transitions:
/// - Processing -> Completed
/// - Processing -> Failed
/// - Processing -> Pending -> Processing (overload re-enqueue, bounded by max_retries)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Back in the queue, waiting for a worker.
    Pending,

    /// Picked up by a worker.
    Processing,

    /// Handler returned a result.
    Completed,

    /// Handler failed permanently or the retry budget ran out.
    Failed,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
