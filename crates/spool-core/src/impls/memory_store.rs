//! InMemoryStore - 開発用の調整ストア
//!
//! Implements every [`CoordinationStore`] primitive inside one process: the
//! whole state sits behind a single mutex, so each call is trivially atomic.
//! Blocking pops park on a `Notify` that `zadd` wakes.
//!
//! Equal scores pop in insertion order here. Callers must not rely on that:
//! other stores break ties differently.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashMap};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::ports::{CoordinationStore, ScoredMember, StoreError, WindowAdmission, WindowCount};

/// Total order over f64 scores.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Score(f64);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Rank key: highest score last; among equal scores the oldest insert last.
type Rank = (Score, Reverse<u64>);

#[derive(Debug, Default)]
struct SortedSet {
    by_rank: BTreeMap<Rank, String>,
    index: HashMap<String, Rank>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64, seq: u64) {
        if let Some(old) = self.index.remove(member) {
            self.by_rank.remove(&old);
        }
        let rank = (Score(score), Reverse(seq));
        self.by_rank.insert(rank, member.to_string());
        self.index.insert(member.to_string(), rank);
    }

    fn pop_max(&mut self) -> Option<ScoredMember> {
        let ((score, _), member) = self.by_rank.pop_last()?;
        self.index.remove(&member);
        Some(ScoredMember::new(member, score.0))
    }

    fn peek_max(&self) -> Option<ScoredMember> {
        self.by_rank
            .last_key_value()
            .map(|((score, _), member)| ScoredMember::new(member.clone(), score.0))
    }

    fn purge_up_to(&mut self, max_score: f64) {
        while let Some(((score, _), _)) = self.by_rank.first_key_value() {
            if score.0 > max_score {
                break;
            }
            if let Some((_, member)) = self.by_rank.pop_first() {
                self.index.remove(&member);
            }
        }
    }

    fn oldest(&self) -> Option<f64> {
        self.by_rank.first_key_value().map(|((score, _), _)| score.0)
    }

    fn len(&self) -> usize {
        self.by_rank.len()
    }

    fn is_empty(&self) -> bool {
        self.by_rank.is_empty()
    }
}

#[derive(Debug)]
struct Expiring {
    value: String,
    expires_at: Instant,
}

impl Expiring {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
struct State {
    sets: HashMap<String, SortedSet>,
    values: HashMap<String, Expiring>,
    seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Live value at `key`, dropping it first if it has expired.
    fn live_value(&mut self, key: &str) -> Option<&mut Expiring> {
        let now = Instant::now();
        if self.values.get(key).is_some_and(|v| !v.is_live(now)) {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }

    fn pop_max(&mut self, key: &str) -> Option<ScoredMember> {
        let set = self.sets.get_mut(key)?;
        let popped = set.pop_max();
        if set.is_empty() {
            self.sets.remove(key);
        }
        popped
    }
}

/// In-process [`CoordinationStore`].
///
/// # 使用例
/// ```ignore
/// let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
/// let queue = PriorityQueue::new(store.clone(), "spool", &QueueConfig::default());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    /// zadd 時の通知用
    notify: Notify,
    /// Simulated outage switch for tests.
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StoreError::Unavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, AtomicOrdering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        {
            let mut state = self.state.lock().await;
            let seq = state.next_seq();
            state
                .sets
                .entry(key.to_string())
                .or_default()
                .insert(member, score, seq);
        }
        // 待機中の bzpop_max を起こす
        self.notify.notify_waiters();
        Ok(())
    }

    async fn zpop_max(&self, key: &str) -> Result<Option<ScoredMember>, StoreError> {
        self.ensure_available()?;
        Ok(self.state.lock().await.pop_max(key))
    }

    async fn bzpop_max(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<ScoredMember>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking, so a zadd in between is not missed.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            if let Some(popped) = self.zpop_max(key).await? {
                return Ok(Some(popped));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn zpeek_max(&self, key: &str) -> Result<Option<ScoredMember>, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.sets.get(key).and_then(SortedSet::peek_max))
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.sets.get(key).map_or(0, |s| s.len() as u64))
    }

    async fn zrange_all(&self, key: &str) -> Result<Vec<ScoredMember>, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .sets
            .get(key)
            .map(|set| {
                set.by_rank
                    .iter()
                    .map(|((score, _), member)| ScoredMember::new(member.clone(), score.0))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zpurge_and_count(&self, key: &str, max_score: f64) -> Result<WindowCount, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let Some(set) = state.sets.get_mut(key) else {
            return Ok(WindowCount::default());
        };
        set.purge_up_to(max_score);
        Ok(WindowCount {
            count: set.len() as u64,
            oldest: set.oldest(),
        })
    }

    async fn zadmit(
        &self,
        key: &str,
        max_score: f64,
        limit: u64,
        score: f64,
        member: &str,
    ) -> Result<WindowAdmission, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let seq = state.next_seq();
        let set = state.sets.entry(key.to_string()).or_default();
        set.purge_up_to(max_score);
        let window = WindowCount {
            count: set.len() as u64,
            oldest: set.oldest(),
        };
        let admitted = window.count < limit;
        if admitted {
            set.insert(member, score, seq);
        }
        if set.is_empty() {
            state.sets.remove(key);
        }
        Ok(WindowAdmission { admitted, window })
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let had_set = state.sets.remove(key).is_some();
        let had_value = state.live_value(key).is_some();
        state.values.remove(key);
        Ok(had_set || had_value)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        if state.live_value(key).is_some() {
            return Ok(false);
        }
        state.values.insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let matches = state.live_value(key).is_some_and(|v| v.value == value);
        if matches {
            state.values.remove(key);
        }
        Ok(matches)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        state.values.insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        Ok(state.live_value(key).map(|v| v.value.clone()))
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let current = match state.live_value(key) {
            Some(entry) => entry
                .value
                .parse::<i64>()
                .map_err(|_| StoreError::Protocol(format!("value at {key} is not an integer")))?,
            None => 0,
        };
        let next = current + 1;
        state.values.insert(
            key.to_string(),
            Expiring {
                value: next.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(next)
    }
}
