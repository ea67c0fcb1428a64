//! Configuration for every component.
//!
//! Missing fields fall back to their defaults, so a config file only needs the
//! values it wants to change:
//!
//! ```json
//! { "key_prefix": "mdm", "rate_limit": { "rate_limit": 240 } }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoolConfig {
    /// Namespace for every key written to the coordination store.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub results: ResultConfig,
}

fn default_key_prefix() -> String {
    "spool".to_string()
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            queue: QueueConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            worker: WorkerConfig::default(),
            results: ResultConfig::default(),
        }
    }
}

impl SpoolConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::Invalid("key_prefix must not be empty".into()));
        }
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid("worker.concurrency must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.rate_limit.rate_limit == 0 {
            return Err(ConfigError::Invalid("rate_limit.rate_limit must be at least 1".into()));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid("rate_limit.window_secs must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(ConfigError::Invalid("retry.jitter_ratio must be within [0, 1]".into()));
        }
        Ok(())
    }
}

/// Priority queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue name; processes sharing a name share the queue.
    #[serde(default = "default_queue_name")]
    pub name: String,
}

fn default_queue_name() -> String {
    "tasks".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
        }
    }
}

/// Sliding-window rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Limiter name; processes sharing a name share the budget.
    #[serde(default = "default_limiter_name")]
    pub name: String,

    /// Max requests per window.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    /// Kept for interface compatibility; does not change window accounting.
    #[serde(default = "default_burst")]
    pub burst: u32,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Upper bound on re-checks inside one `wait`.
    #[serde(default = "default_max_wait_iterations")]
    pub max_wait_iterations: u32,
}

fn default_limiter_name() -> String {
    "default".to_string()
}

fn default_rate_limit() -> u32 {
    60
}

fn default_burst() -> u32 {
    10
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_wait_iterations() -> u32 {
    1000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            name: default_limiter_name(),
            rate_limit: default_rate_limit(),
            burst: default_burst(),
            window_secs: default_window_secs(),
            max_wait_iterations: default_max_wait_iterations(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Retry coordinator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Upper bound of the random extra delay, as a fraction of the delay.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// How long one attempt may hold the operation lock.
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// Pause before the best-effort run when another process holds the lock.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,

    #[serde(default = "default_counter_ttl_secs")]
    pub counter_ttl_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_ratio() -> f64 {
    0.1
}

fn default_lock_ttl_ms() -> u64 {
    30_000
}

fn default_lock_wait_ms() -> u64 {
    100
}

fn default_counter_ttl_secs() -> u64 {
    3_600
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_wait_ms: default_lock_wait_ms(),
            counter_ttl_secs: default_counter_ttl_secs(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn counter_ttl(&self) -> Duration {
        Duration::from_secs(self.counter_ttl_secs)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Idle sleep between empty dequeues.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Priority taken off a task on each overload re-enqueue.
    #[serde(default = "default_priority_step")]
    pub priority_step: i32,

    /// Sleep between result polls in `wait_for_task_result`.
    #[serde(default = "default_result_poll_interval_ms")]
    pub result_poll_interval_ms: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_priority_step() -> i32 {
    50
}

fn default_result_poll_interval_ms() -> u64 {
    100
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            priority_step: default_priority_step(),
            result_poll_interval_ms: default_result_poll_interval_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn result_poll_interval(&self) -> Duration {
        Duration::from_millis(self.result_poll_interval_ms)
    }
}

/// Result store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultConfig {
    /// How long result records live in the store.
    #[serde(default = "default_result_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_result_ttl_secs() -> u64 {
    86_400
}

impl Default for ResultConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_result_ttl_secs(),
        }
    }
}

impl ResultConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}
