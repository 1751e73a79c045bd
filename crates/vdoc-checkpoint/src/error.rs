//! Checkpoint store error types.

use thiserror::Error;

/// Result type for checkpoint operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Errors that can occur while loading or persisting checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Artifact cleanup failed: {0}")]
    ArtifactCleanup(String),
}

impl CheckpointError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }
}
