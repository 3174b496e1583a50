//! Handler-level error type.

use thiserror::Error;

/// Errors returned by a handler's `execute` method.
///
/// The variant is the failure classification carried back to the engine:
/// - `Retryable`: the task is re-attempted according to its retry policy.
/// - `Fatal`    : the task fails without consulting the retry policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient failure; the engine may re-attempt the task.
    #[error("retryable task error: {0}")]
    Retryable(String),

    /// Permanent failure (bad input, unsupported request, ...).
    #[error("fatal task error: {0}")]
    Fatal(String),
}

impl HandlerError {
    /// Whether the failure may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// The human-readable failure reason without the classification prefix.
    pub fn reason(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Fatal(msg) => msg,
        }
    }
}
