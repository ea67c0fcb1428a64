//! Sliding-window rate limiter shared by every process using the same name.
//!
//! Each admitted request is an ordered-set entry scored by its timestamp in
//! milliseconds. A check purges entries that left the window, counts what is
//! left and records a new entry only if the count is under the limit, all in
//! one atomic store call. Concurrent callers never overshoot the limit.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use ulid::Ulid;

use crate::config::RateLimitConfig;
use crate::ports::{Clock, CoordinationStore, StoreError, WindowAdmission};

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("rate limit wait cancelled")]
    Cancelled,

    /// `retry_after` is when the last denied check expected room.
    #[error("rate limit still exceeded after {iterations} checks")]
    WaitExhausted { iterations: u32, retry_after: Duration },
}

/// Outcome of one window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Earliest point at which an entry leaves the window.
    Denied { retry_after: Duration },
}

pub struct RateLimiter {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    key: String,
    window: Duration,
    limit: AtomicU32,
    burst: AtomicU32,
    max_wait_iterations: u32,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        key_prefix: &str,
        config: &RateLimitConfig,
    ) -> Self {
        Self {
            store,
            clock,
            key: format!("{key_prefix}:ratelimit:{}", config.name),
            window: config.window(),
            limit: AtomicU32::new(config.rate_limit),
            burst: AtomicU32::new(config.burst),
            max_wait_iterations: config.max_wait_iterations.max(1),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn limit(&self) -> u32 {
        self.limit.load(Ordering::Relaxed)
    }

    /// Takes effect on the next check.
    pub fn set_limit(&self, limit: u32) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    pub fn burst(&self) -> u32 {
        self.burst.load(Ordering::Relaxed)
    }

    /// Stored only; window accounting ignores it.
    pub fn set_burst(&self, burst: u32) {
        self.burst.store(burst, Ordering::Relaxed);
    }

    /// Non-blocking check. Records a request only when it is admitted.
    pub async fn allow(&self) -> Result<bool, RateLimitError> {
        Ok(matches!(self.check().await?, Admission::Admitted))
    }

    /// Block until a request is admitted.
    ///
    /// Gives up with [`RateLimitError::WaitExhausted`] after
    /// `max_wait_iterations` denied checks. Cancellation records nothing.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        let mut retry_after = self.window;
        for iteration in 1..=self.max_wait_iterations {
            if cancel.is_cancelled() {
                return Err(RateLimitError::Cancelled);
            }

            retry_after = match self.check().await? {
                Admission::Admitted => return Ok(()),
                Admission::Denied { retry_after } => retry_after,
            };

            if iteration == self.max_wait_iterations {
                break;
            }

            trace!(limiter = %self.key, ?retry_after, iteration, "rate limited, waiting");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                _ = tokio::time::sleep(retry_after) => {}
            }
        }

        debug!(limiter = %self.key, iterations = self.max_wait_iterations, "rate limit wait exhausted");
        Err(RateLimitError::WaitExhausted {
            iterations: self.max_wait_iterations,
            retry_after,
        })
    }

    /// One purge-count-record round.
    pub async fn check(&self) -> Result<Admission, RateLimitError> {
        let now_ms = self.clock.now_millis();
        let window_ms = self.window.as_millis() as i64;
        let cutoff = (now_ms - window_ms) as f64;

        let limit = u64::from(self.limit());
        let request_id = format!("{now_ms}-{}", Ulid::new());

        let WindowAdmission { admitted, window } = self
            .store
            .zadmit(&self.key, cutoff, limit, now_ms as f64, &request_id)
            .await?;
        if admitted {
            trace!(limiter = %self.key, count = window.count + 1, limit, "request admitted");
            return Ok(Admission::Admitted);
        }

        let retry_after = match window.oldest {
            Some(oldest) => {
                let expires_at = oldest as i64 + window_ms;
                Duration::from_millis((expires_at - now_ms).max(1) as u64)
            }
            None => self.window,
        };
        Ok(Admission::Denied { retry_after })
    }

    /// Requests currently inside the window (purges expired ones first).
    pub async fn in_window(&self) -> Result<u64, RateLimitError> {
        let cutoff = (self.clock.now_millis() - self.window.as_millis() as i64) as f64;
        Ok(self.store.zpurge_and_count(&self.key, cutoff).await?.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryStore;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use tokio::time::Instant;

    fn config(limit: u32) -> RateLimitConfig {
        RateLimitConfig {
            rate_limit: limit,
            window_secs: 60,
            ..RateLimitConfig::default()
        }
    }

    fn fixed_limiter(limit: u32) -> (RateLimiter, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let limiter = RateLimiter::new(
            Arc::new(InMemoryStore::new()),
            clock.clone(),
            "test",
            &config(limit),
        );
        (limiter, clock)
    }

    #[rstest]
    #[case(1)]
    #[case(5)]
    #[case(60)]
    #[tokio::test]
    async fn admits_at_most_limit_per_window(#[case] limit: u32) {
        let (limiter, _clock) = fixed_limiter(limit);

        let mut admitted = 0;
        for _ in 0..=limit {
            if limiter.allow().await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, limit);
        assert_eq!(limiter.in_window().await.unwrap(), u64::from(limit));
    }

    #[tokio::test]
    async fn window_slides_with_time() {
        let (limiter, clock) = fixed_limiter(2);
        assert!(limiter.allow().await.unwrap());
        clock.advance(Duration::from_secs(30));
        assert!(limiter.allow().await.unwrap());
        assert!(!limiter.allow().await.unwrap());

        // 最初のエントリだけが窓から外れる
        clock.advance(Duration::from_secs(31));
        assert!(limiter.allow().await.unwrap());
        assert!(!limiter.allow().await.unwrap());
    }

    #[tokio::test]
    async fn denial_reports_time_until_oldest_expires() {
        let (limiter, clock) = fixed_limiter(1);
        assert!(limiter.allow().await.unwrap());
        clock.advance(Duration::from_secs(45));

        let admission = limiter.check().await.unwrap();
        assert_eq!(
            admission,
            Admission::Denied {
                retry_after: Duration::from_secs(15)
            }
        );
    }

    #[tokio::test]
    async fn limit_changes_apply_to_next_check() {
        let (limiter, _clock) = fixed_limiter(1);
        assert!(limiter.allow().await.unwrap());
        assert!(!limiter.allow().await.unwrap());

        limiter.set_limit(3);
        limiter.set_burst(99);
        assert_eq!(limiter.burst(), 99);
        assert!(limiter.allow().await.unwrap());
        assert!(limiter.allow().await.unwrap());
        assert!(!limiter.allow().await.unwrap());
    }

    #[tokio::test]
    async fn wait_returns_once_window_frees_up() {
        let limiter = RateLimiter::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(SystemClock),
            "test",
            &RateLimitConfig {
                rate_limit: 1,
                window_secs: 1,
                ..RateLimitConfig::default()
            },
        );
        assert!(limiter.allow().await.unwrap());

        let start = Instant::now();
        limiter.wait(&CancellationToken::new()).await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn cancelled_wait_records_nothing() {
        let (limiter, _clock) = fixed_limiter(1);
        assert!(limiter.allow().await.unwrap());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = limiter.wait(&cancel).await.unwrap_err();

        assert!(matches!(err, RateLimitError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(limiter.in_window().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn wait_gives_up_after_max_iterations() {
        let (limiter, clock) = fixed_limiter(1);
        let limiter = RateLimiter {
            max_wait_iterations: 1,
            ..limiter
        };
        assert!(limiter.allow().await.unwrap());
        clock.advance(Duration::from_secs(20));

        let start = Instant::now();
        let err = limiter.wait(&CancellationToken::new()).await.unwrap_err();

        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(matches!(
            err,
            RateLimitError::WaitExhausted { iterations: 1, retry_after } if retry_after == Duration::from_secs(40)
        ));
        assert_eq!(limiter.in_window().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_checks_never_exceed_limit() {
        let (limiter, _clock) = fixed_limiter(5);
        let limiter = Arc::new(limiter);

        let checks: Vec<_> = (0..40)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow().await.unwrap() })
            })
            .collect();
        let mut admitted = 0;
        for check in checks {
            if check.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 5);
        assert_eq!(limiter.in_window().await.unwrap(), 5);
    }
}
