//! Structured job logging utilities.

use tracing::{error, info, warn, Span};
use vdoc_models::UploadId;

/// Job logger for structured logging with consistent formatting.
#[derive(Debug, Clone)]
pub struct JobLogger {
    upload_id: String,
    operation: String,
}

impl JobLogger {
    /// Create a new job logger for a specific upload and operation.
    pub fn new(upload_id: &UploadId, operation: &str) -> Self {
        Self {
            upload_id: upload_id.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Log the start of a job operation.
    pub fn log_start(&self, message: &str) {
        info!(
            upload_id = %self.upload_id,
            operation = %self.operation,
            "Job started: {}", message
        );
    }

    /// Log a progress update during job execution.
    pub fn log_progress(&self, message: &str) {
        info!(
            upload_id = %self.upload_id,
            operation = %self.operation,
            "Job progress: {}", message
        );
    }

    /// Log a warning during job execution.
    pub fn log_warning(&self, message: &str) {
        warn!(
            upload_id = %self.upload_id,
            operation = %self.operation,
            "Job warning: {}", message
        );
    }

    /// Log an error during job execution.
    pub fn log_error(&self, message: &str) {
        error!(
            upload_id = %self.upload_id,
            operation = %self.operation,
            "Job error: {}", message
        );
    }

    /// Log the completion of a job operation.
    pub fn log_completion(&self, message: &str) {
        info!(
            upload_id = %self.upload_id,
            operation = %self.operation,
            "Job completed: {}", message
        );
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Create a tracing span for this job.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            upload_id = %self.upload_id,
            operation = %self.operation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_logger_creation() {
        let upload_id = UploadId::from_string("up-1");
        let logger = JobLogger::new(&upload_id, "process_upload");

        assert_eq!(logger.upload_id(), "up-1");
        assert_eq!(logger.operation(), "process_upload");
    }
}
