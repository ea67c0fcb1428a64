//! Errors - handler エラーの分類
//!
//! Handlers report failures as [`HandlerError`]. The worker pool and the retry
//! coordinator only look at the [`ErrorKind`], never at the message.

use serde::{Deserialize, Serialize};

/// ErrorKind は実行エラーの分類
///
/// - Overload: upstream throttling ("too many requests"). The worker pool
///   degrades priority and re-enqueues.
/// - Retryable: transient, worth another attempt with backoff.
/// - NonRetryable: retrying cannot help; surfaced immediately.
/// - Generic: unclassified. Retried at most once by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Overload,
    Retryable,
    NonRetryable,
    Generic,
}

/// Anything the retry coordinator can decide on.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// Failure returned by a task handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    kind: ErrorKind,
    message: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn overload(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Overload, message)
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retryable, message)
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NonRetryable, message)
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Generic, message)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_overload(&self) -> bool {
        self.kind == ErrorKind::Overload
    }
}

impl Classify for HandlerError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_kind() {
        assert_eq!(HandlerError::overload("429").kind(), ErrorKind::Overload);
        assert_eq!(HandlerError::retryable("eof").kind(), ErrorKind::Retryable);
        assert_eq!(HandlerError::non_retryable("400").kind(), ErrorKind::NonRetryable);
        assert_eq!(HandlerError::generic("?").kind(), ErrorKind::Generic);
    }

    #[test]
    fn display_is_the_message() {
        let err = HandlerError::overload("quota exceeded for devices.patch");
        assert!(err.is_overload());
        assert_eq!(err.to_string(), "quota exceeded for devices.patch");
    }
}
