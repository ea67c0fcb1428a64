use thiserror::Error;

use crate::app::BuildError;
use crate::config::ConfigError;
use crate::ports::StoreError;
use crate::queue::QueueError;
use crate::rate_limit::RateLimitError;
use crate::results::ResultError;
use crate::runtime::RegistryError;
use crate::worker::WorkerError;

/// Any failure surfaced by the [`crate::app::Spool`] facade.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Result(#[from] ResultError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),
}
