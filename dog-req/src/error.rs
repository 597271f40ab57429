use thiserror::Error;

use crate::backend::StoreError;

/// Result type for queue operations
pub type ReqResult<T> = Result<T, ReqError>;

/// Errors surfaced by the storage engine and the queue façade
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReqError {
    /// The targeted key or member is absent. Never retried; callers decide
    /// what it means (no ready task, lease already reclaimed, unmapped name).
    #[error("Not found: {0}")]
    NotFound(String),

    /// A maintenance lock is held by another process
    #[error("Lock already held: {0}")]
    Locked(String),

    /// Backing store connectivity or operation failure
    #[error("Transient store failure: {0}")]
    Transient(String),

    /// Transient failures kept happening until the retry limit was reached
    #[error("{op} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        message: String,
    },

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A background maintenance task ended abnormally
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReqError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn locked(key: impl Into<String>) -> Self {
        Self::Locked(key.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Whether the retry wrapper may attempt the operation again
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Data or versioning defects that no amount of retrying fixes
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Encode(_) | Self::Decode(_) | Self::RetriesExhausted { .. } | Self::InvalidConfig(_)
        )
    }
}

/// Outcome of a failed task handler; decides what happens to the task
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// Try again later, subject to the queue's attempt limit
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Bury the task right away
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl TaskError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

impl From<StoreError> for ReqError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Self::Transient(msg),
            StoreError::InvalidData(msg) => Self::Decode(msg),
        }
    }
}
