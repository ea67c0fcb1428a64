use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spool_core::domain::{HandlerError, Task, TaskStatus};
use spool_core::impls::InMemoryStore;
use spool_core::ports::CoordinationStore;
use spool_core::retry::RetryCoordinator;
use spool_core::runtime::{TaskContext, TaskHandler, handler_fn};
use spool_core::{SpoolBuilder, SpoolConfig};
use spool_redis::RedisStore;

/// Enqueue demo tasks, run a worker pool over them and print the results.
#[derive(Debug, Parser)]
#[command(name = "spool", version)]
struct Args {
    /// Redis URL; the in-memory store is used when omitted.
    #[arg(long, env = "SPOOL_REDIS_URL")]
    redis_url: Option<String>,

    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides worker.concurrency.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Number of demo tasks to enqueue.
    #[arg(long, default_value_t = 10)]
    tasks: usize,

    /// Overrides rate_limit.rate_limit (requests per window).
    #[arg(long)]
    rate_limit: Option<u32>,

    /// How long to wait for each result.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct DemoPayload {
    n: usize,
}

const PRIORITIES: [i32; 5] = [300, 700, 500, 900, 100];
const TASK_TYPES: [&str; 3] = ["echo", "flaky", "throttled"];

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let store: Arc<dyn CoordinationStore> = match &args.redis_url {
        Some(url) => Arc::new(
            RedisStore::connect(url)
                .await
                .context("failed to connect to redis")?,
        ),
        None => {
            info!("no --redis-url given, using the in-memory store");
            Arc::new(InMemoryStore::new())
        }
    };

    let retry = Arc::new(RetryCoordinator::new(
        store.clone(),
        &config.key_prefix,
        &config.retry,
    ));

    let spool = SpoolBuilder::new(store)
        .config(config)
        .register("echo", handler_fn(|_ctx, payload| async move { Ok(payload) }))?
        .register("flaky", flaky_handler(retry))?
        .register("throttled", throttled_handler())?
        .expect_tasks(&TASK_TYPES)
        .build()?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, shutting down");
                cancel.cancel();
            }
        }
    });

    let mut callbacks = Vec::with_capacity(args.tasks);
    for n in 0..args.tasks {
        let task = Task::builder(TASK_TYPES[n % TASK_TYPES.len()])
            .payload_json(&json!({ "n": n }))?
            .max_retries(3)
            .build();
        let priority = PRIORITIES[n % PRIORITIES.len()];
        callbacks.push(spool.submit(task, priority).await?);
    }
    info!(tasks = args.tasks, "enqueued demo tasks");

    spool.start(&cancel)?;

    let timeout = Duration::from_secs(args.timeout_secs);
    let mut failed = 0usize;
    for callback in callbacks {
        match spool.wait_for_result(callback, timeout, &cancel).await {
            Ok(record) => {
                if record.status == TaskStatus::Failed {
                    failed += 1;
                }
                println!("{}", serde_json::to_string(&record)?);
            }
            Err(err) => {
                warn!(%callback, error = %err, "no result");
                failed += 1;
            }
        }
    }

    spool.shutdown().await;

    let queue = spool.queue_stats().await?;
    let pool = spool.pool_stats();
    println!(
        "{}",
        serde_json::to_string(&json!({ "queue": queue, "pool": pool, "failed": failed }))?
    );
    Ok(())
}

fn load_config(args: &Args) -> Result<SpoolConfig> {
    let mut config = match &args.config {
        Some(path) => SpoolConfig::from_path(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SpoolConfig::default(),
    };
    if let Some(concurrency) = args.concurrency {
        config.worker.concurrency = concurrency;
    }
    if let Some(rate_limit) = args.rate_limit {
        config.rate_limit.rate_limit = rate_limit;
    }
    config.validate()?;
    Ok(config)
}

fn decode(payload: &Value) -> Result<DemoPayload, HandlerError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| HandlerError::non_retryable(format!("json decode: {e}")))
}

/// Fails the first call for each task, then succeeds under the retry
/// coordinator.
fn flaky_handler(retry: Arc<RetryCoordinator>) -> Arc<dyn TaskHandler> {
    let seen = Arc::new(Mutex::new(HashSet::new()));
    handler_fn(move |ctx: TaskContext, payload: Value| {
        let retry = retry.clone();
        let seen = seen.clone();
        async move {
            let n = decode(&payload)?.n;
            let op_id = format!("demo-flaky-{n}");
            retry
                .execute(&ctx.cancel, &op_id, || {
                    let first = seen.lock().unwrap_or_else(|e| e.into_inner()).insert(n);
                    async move {
                        if first {
                            Err(HandlerError::retryable("connection reset"))
                        } else {
                            Ok(json!({ "n": n, "attempts": 2 }))
                        }
                    }
                })
                .await
                .map_err(|err| {
                    err.into_inner()
                        .unwrap_or_else(|| HandlerError::generic("retry cancelled"))
                })
        }
    })
}

/// Reports overload on the first call for each task so the pool re-enqueues
/// it at a lower priority.
fn throttled_handler() -> Arc<dyn TaskHandler> {
    let seen = Arc::new(Mutex::new(HashSet::new()));
    handler_fn(move |_ctx: TaskContext, payload: Value| {
        let seen = seen.clone();
        async move {
            let n = decode(&payload)?.n;
            let first = seen.lock().unwrap_or_else(|e| e.into_inner()).insert(n);
            if first {
                return Err(HandlerError::overload("429 too many requests"));
            }
            Ok(json!({ "n": n, "throttled_once": true }))
        }
    })
}
