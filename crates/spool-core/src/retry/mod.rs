//! Retry - バックオフと実行調整
//!
//! - `policy`: backoff delay computation
//! - `coordinator`: lock-guarded, classified retries shared across processes

pub mod coordinator;
pub mod policy;

pub use self::coordinator::{RetryCoordinator, RetryError};
pub use self::policy::RetryPolicy;
