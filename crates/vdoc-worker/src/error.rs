//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Report generation failed: {0}")]
    ReportFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    Storage(#[from] vdoc_storage::StorageError),

    #[error("Media error: {0}")]
    Media(#[from] vdoc_media::MediaError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] vdoc_checkpoint::CheckpointError),

    #[error("Provider error: {0}")]
    Provider(#[from] vdoc_providers::ProviderError),

    #[error("Queue error: {0}")]
    Queue(#[from] vdoc_queue::QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn processing_failed(msg: impl Into<String>) -> Self {
        Self::ProcessingFailed(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Fatal input errors: corrupt media, missing streams, bad job fields.
    /// Retrying cannot help, so the job fails immediately.
    pub fn is_fatal_input(&self) -> bool {
        match self {
            Self::InvalidInput(_) => true,
            Self::Media(e) => e.is_fatal_input(),
            Self::Provider(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Transient errors worth a redelivery: storage, network, timeouts.
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal_input()
            && matches!(
                self,
                Self::DownloadFailed(_)
                    | Self::Storage(_)
                    | Self::Queue(_)
                    | Self::Checkpoint(_)
                    | Self::Provider(_)
                    | Self::Media(_)
                    | Self::Io(_)
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_is_fatal() {
        let err = WorkerError::invalid_input("no video stream");
        assert!(err.is_fatal_input());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_download_failure_is_retryable() {
        let err = WorkerError::DownloadFailed("stalled".into());
        assert!(err.is_retryable());
        assert!(!err.is_fatal_input());
    }
}
