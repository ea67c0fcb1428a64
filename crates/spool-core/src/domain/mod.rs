//! Domain model (ids, tasks, results, error classification).

pub mod errors;
pub mod ids;
pub mod result;
pub mod status;
pub mod task;

pub use self::errors::{Classify, ErrorKind, HandlerError};
pub use self::ids::{CallbackId, TaskId};
pub use self::result::TaskResult;
pub use self::status::TaskStatus;
pub use self::task::{
    DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY, Task, TaskBuilder, TaskType,
    clamp_priority,
};
