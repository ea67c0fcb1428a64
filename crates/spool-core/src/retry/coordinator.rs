//! Cross-process retry coordination.
//!
//! An attempt runs under a short-lived lock keyed by the operation id, so two
//! processes retrying the same operation do not run it at the same time. Lock
//! acquisition is best effort: when the store is unreachable the attempt runs
//! without the lock.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::policy::RetryPolicy;
use crate::config::RetryConfig;
use crate::domain::{Classify, ErrorKind};
use crate::ports::{CoordinationStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("operation failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("operation failed permanently: {0}")]
    Permanent(E),

    #[error("retry cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The operation's own error, if one was kept.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::Permanent(err) => Some(err),
            Self::Cancelled => None,
        }
    }
}

pub struct RetryCoordinator {
    store: Arc<dyn CoordinationStore>,
    policy: RetryPolicy,
    key_prefix: String,
    max_attempts: u32,
    lock_ttl: Duration,
    lock_wait: Duration,
    counter_ttl: Duration,
}

impl RetryCoordinator {
    pub fn new(store: Arc<dyn CoordinationStore>, key_prefix: &str, config: &RetryConfig) -> Self {
        Self {
            store,
            policy: RetryPolicy::from_config(config),
            key_prefix: key_prefix.to_string(),
            max_attempts: config.max_attempts.max(1),
            lock_ttl: config.lock_ttl(),
            lock_wait: config.lock_wait(),
            counter_ttl: config.counter_ttl(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn lock_key(&self, operation_id: &str) -> String {
        format!("{}:retry:lock:{operation_id}", self.key_prefix)
    }

    fn counter_key(&self, operation_id: &str) -> String {
        format!("{}:retry:count:{operation_id}", self.key_prefix)
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of
    /// attempts.
    ///
    /// - `NonRetryable` errors return at once.
    /// - `Generic` errors get one retry after the first attempt only.
    /// - `Retryable` and `Overload` errors back off and retry.
    pub async fn execute<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation_id: &str,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let lock_key = self.lock_key(operation_id);
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            let is_last = attempt + 1 >= self.max_attempts;

            let token = Ulid::new().to_string();
            let outcome = match self.store.set_nx(&lock_key, &token, self.lock_ttl).await {
                Ok(true) => {
                    debug!(operation_id, attempt, "retry lock acquired");
                    let outcome = run_cancellable::<_, E>(cancel, operation()).await;
                    self.release_lock(&lock_key, &token).await;
                    outcome?
                }
                Ok(false) => {
                    // 他プロセスが実行中: ロック外で一度だけ覗く
                    debug!(operation_id, attempt, "retry lock held elsewhere");
                    sleep_cancellable::<E>(cancel, self.lock_wait).await?;
                    match run_cancellable::<_, E>(cancel, operation()).await? {
                        Ok(value) => return Ok(value),
                        Err(err) if is_last => {
                            return Err(RetryError::Exhausted {
                                attempts: attempt + 1,
                                last: err,
                            });
                        }
                        Err(err) => {
                            debug!(operation_id, attempt, error = %err, "best-effort attempt failed");
                            attempt += 1;
                            continue;
                        }
                    }
                }
                Err(err) => {
                    warn!(operation_id, error = %err, "retry lock unavailable, running unguarded");
                    run_cancellable::<_, E>(cancel, operation()).await?
                }
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        info!(operation_id, attempts = attempt + 1, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            match err.kind() {
                ErrorKind::NonRetryable => {
                    debug!(operation_id, attempt, error = %err, "non-retryable failure");
                    return Err(RetryError::Permanent(err));
                }
                ErrorKind::Generic if attempt > 0 => {
                    debug!(operation_id, attempt, error = %err, "generic failure after retry");
                    return Err(RetryError::Permanent(err));
                }
                ErrorKind::Generic | ErrorKind::Retryable | ErrorKind::Overload => {}
            }

            if is_last {
                warn!(operation_id, attempts = attempt + 1, error = %err, "retry attempts exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt + 1,
                    last: err,
                });
            }

            let delay = self.policy.next_delay(attempt);
            info!(operation_id, attempt, ?delay, error = %err, "scheduling retry");
            sleep_cancellable::<E>(cancel, delay).await?;

            if let Err(err) = self
                .store
                .incr_ex(&self.counter_key(operation_id), self.counter_ttl)
                .await
            {
                warn!(operation_id, error = %err, "failed to bump retry counter");
            }
            attempt += 1;
        }
    }

    /// Retries scheduled for `operation_id` within the counter's TTL.
    pub async fn retry_count(&self, operation_id: &str) -> Result<u64, StoreError> {
        match self.store.get(&self.counter_key(operation_id)).await? {
            Some(raw) => raw
                .parse()
                .map_err(|_| StoreError::Protocol(format!("retry counter is not an integer: {raw}"))),
            None => Ok(0),
        }
    }

    async fn release_lock(&self, lock_key: &str, token: &str) {
        if let Err(err) = self.store.delete_if_equals(lock_key, token).await {
            warn!(lock_key, error = %err, "failed to release retry lock");
        }
    }
}

async fn run_cancellable<Fut, E>(
    cancel: &CancellationToken,
    fut: Fut,
) -> Result<Fut::Output, RetryError<E>>
where
    Fut: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RetryError::Cancelled),
        output = fut => Ok(output),
    }
}

async fn sleep_cancellable<E>(cancel: &CancellationToken, delay: Duration) -> Result<(), RetryError<E>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RetryError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HandlerError;
    use crate::impls::InMemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 5,
            max_delay_ms: 20,
            jitter_ratio: 0.0,
            lock_wait_ms: 5,
            ..RetryConfig::default()
        }
    }

    fn coordinator(store: Arc<InMemoryStore>, max_attempts: u32) -> RetryCoordinator {
        RetryCoordinator::new(store, "test", &fast_config(max_attempts))
    }

    /// Fails with the given errors in order, then succeeds.
    fn scripted(
        calls: Arc<AtomicU32>,
        failures: Vec<HandlerError>,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<&'static str, HandlerError>> + Send>>
    {
        move || {
            let call = calls.fetch_add(1, Ordering::SeqCst) as usize;
            let next = failures.get(call).cloned();
            Box::pin(async move {
                match next {
                    Some(err) => Err(err),
                    None => Ok("done"),
                }
            })
        }
    }

    #[tokio::test]
    async fn success_after_two_failures_counts_two_retries() {
        let store = Arc::new(InMemoryStore::new());
        let retry = coordinator(store, 3);
        let calls = Arc::new(AtomicU32::new(0));

        let out = retry
            .execute(
                &CancellationToken::new(),
                "op-1",
                scripted(
                    calls.clone(),
                    vec![HandlerError::retryable("a"), HandlerError::retryable("b")],
                ),
            )
            .await
            .unwrap();

        assert_eq!(out, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retry.retry_count("op-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn non_retryable_runs_exactly_once() {
        let retry = coordinator(Arc::new(InMemoryStore::new()), 5);
        let calls = Arc::new(AtomicU32::new(0));

        let err = retry
            .execute(
                &CancellationToken::new(),
                "op",
                scripted(calls.clone(), vec![HandlerError::non_retryable("bad input")]),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::Permanent(ref e) if e.message() == "bad input"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retry.retry_count("op").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn generic_error_is_retried_only_once() {
        let retry = coordinator(Arc::new(InMemoryStore::new()), 5);
        let calls = Arc::new(AtomicU32::new(0));

        let err = retry
            .execute(
                &CancellationToken::new(),
                "op",
                scripted(
                    calls.clone(),
                    vec![HandlerError::generic("x"), HandlerError::generic("y")],
                ),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::Permanent(ref e) if e.message() == "y"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhaustion_reports_last_error() {
        let retry = coordinator(Arc::new(InMemoryStore::new()), 3);
        let calls = Arc::new(AtomicU32::new(0));
        let failures = (0..10).map(|i| HandlerError::overload(format!("busy {i}"))).collect();

        let err = retry
            .execute(&CancellationToken::new(), "op", scripted(calls.clone(), failures))
            .await
            .unwrap_err();

        match err {
            RetryError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.message(), "busy 2");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retry.retry_count("op").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn lock_is_released_after_attempt() {
        let store = Arc::new(InMemoryStore::new());
        let retry = coordinator(store.clone(), 1);
        let calls = Arc::new(AtomicU32::new(0));

        retry
            .execute(&CancellationToken::new(), "op", scripted(calls, vec![]))
            .await
            .unwrap();

        let free = store
            .set_nx("test:retry:lock:op", "other-process", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(free);
    }

    #[tokio::test]
    async fn held_lock_falls_back_to_best_effort_run() {
        let store = Arc::new(InMemoryStore::new());
        store
            .set_nx("test:retry:lock:op", "other-process", Duration::from_secs(30))
            .await
            .unwrap();
        let retry = coordinator(store.clone(), 3);
        let calls = Arc::new(AtomicU32::new(0));

        let out = retry
            .execute(&CancellationToken::new(), "op", scripted(calls.clone(), vec![]))
            .await
            .unwrap();

        assert_eq!(out, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // 他プロセスのロックは触らない
        assert_eq!(
            store.get("test:retry:lock:op").await.unwrap().as_deref(),
            Some("other-process")
        );
    }

    #[tokio::test]
    async fn store_outage_still_runs_operation() {
        let store = Arc::new(InMemoryStore::new());
        store.set_unavailable(true);
        let retry = coordinator(store, 3);
        let calls = Arc::new(AtomicU32::new(0));

        let out = retry
            .execute(&CancellationToken::new(), "op", scripted(calls.clone(), vec![]))
            .await
            .unwrap();

        assert_eq!(out, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let retry = RetryCoordinator::new(
            Arc::new(InMemoryStore::new()),
            "test",
            &RetryConfig {
                base_delay_ms: 10_000,
                ..fast_config(3)
            },
        );
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = retry
            .execute(
                &cancel,
                "op",
                scripted(calls.clone(), vec![HandlerError::retryable("later")]),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
