//! CoordinationStore port - プロセス間で共有する調整ストア
//!
//! Everything that must hold across processes (queue order, the rate-limit
//! window, retry locks, result records) goes through the atomic primitives of
//! this trait. Local mutexes are never enough.
//!
//! # 実装
//! - `InMemoryStore` (spool-core): single process, tests and demos
//! - `RedisStore` (spool-redis): production

use std::time::Duration;

use async_trait::async_trait;

/// An ordered-set member with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

impl ScoredMember {
    pub fn new(member: impl Into<String>, score: f64) -> Self {
        Self {
            member: member.into(),
            score,
        }
    }
}

/// What is left of an ordered set after a range purge.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowCount {
    /// Cardinality after the purge.
    pub count: u64,
    /// Lowest remaining score, if any.
    pub oldest: Option<f64>,
}

/// Result of one purge-count-record step.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowAdmission {
    /// Whether the member was recorded.
    pub admitted: bool,
    /// The window after the purge, before the new member was recorded.
    pub window: WindowCount,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("coordination store error: {0}")]
    Backend(String),

    #[error("unexpected reply from coordination store: {0}")]
    Protocol(String),
}

/// Atomic primitives the task subsystem relies on.
///
/// Every method is a single atomic operation from the point of view of other
/// processes, except where the doc says otherwise.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Insert (or re-score) `member` in the ordered set at `key`.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError>;

    /// Remove and return the highest-scored member. Never blocks.
    async fn zpop_max(&self, key: &str) -> Result<Option<ScoredMember>, StoreError>;

    /// Like `zpop_max` but waits up to `timeout` for a member to appear.
    async fn bzpop_max(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<ScoredMember>, StoreError>;

    /// Highest-scored member without removing it.
    async fn zpeek_max(&self, key: &str) -> Result<Option<ScoredMember>, StoreError>;

    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// All members in ascending score order.
    async fn zrange_all(&self, key: &str) -> Result<Vec<ScoredMember>, StoreError>;

    /// Delete every member scored `<= max_score`, then report the remaining
    /// cardinality and lowest score, as one atomic step.
    async fn zpurge_and_count(&self, key: &str, max_score: f64) -> Result<WindowCount, StoreError>;

    /// Purge every member scored `<= max_score`, then record `member` at
    /// `score` only if fewer than `limit` members remain. One atomic step.
    async fn zadmit(
        &self,
        key: &str,
        max_score: f64,
        limit: u64,
        score: f64,
        member: &str,
    ) -> Result<WindowAdmission, StoreError>;

    /// Delete a key of any kind. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Set `key` only if absent, expiring after `ttl`. Returns whether it was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete `key` only while it still holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Unconditional set with expiry.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Atomic increment; (re)arms the key's expiry to `ttl`.
    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;
}
