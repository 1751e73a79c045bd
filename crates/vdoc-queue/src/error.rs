//! Queue error types.

use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to enqueue job: {0}")]
    EnqueueFailed(String),

    #[error("Duplicate job rejected: {0}")]
    Duplicate(String),
}

impl QueueError {
    pub fn enqueue_failed(msg: impl Into<String>) -> Self {
        Self::EnqueueFailed(msg.into())
    }

    /// Whether this error is the dedup check rejecting an already-enqueued
    /// job. Callers racing on resume treat it as success.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}
