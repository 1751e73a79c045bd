//! Job types for the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vdoc_models::{JobId, UploadId};

/// Job to process one uploaded video end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessUploadJob {
    /// Unique job ID
    pub job_id: JobId,
    /// Upload to process
    pub upload_id: UploadId,
    /// User ID
    pub user_id: String,
    /// Blob key of the uploaded source video
    pub source_key: String,
    /// When the job was created
    pub created_at: DateTime<Utc>,
}

impl ProcessUploadJob {
    pub fn new(
        upload_id: UploadId,
        user_id: impl Into<String>,
        source_key: impl Into<String>,
    ) -> Self {
        Self {
            job_id: JobId::new(),
            upload_id,
            user_id: user_id.into(),
            source_key: source_key.into(),
            created_at: Utc::now(),
        }
    }

    /// Generate idempotency key for deduplication.
    pub fn idempotency_key(&self) -> String {
        format!("process:{}:{}", self.user_id, self.upload_id)
    }
}

/// Job to OCR one batch of scenes. Batches chain: completing batch N
/// enqueues batch N+1, so each batch gets its own delivery timeout and
/// retry budget instead of one giant job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrBatchJob {
    /// Unique job ID
    pub job_id: JobId,
    /// Upload this batch belongs to
    pub upload_id: UploadId,
    /// User ID
    pub user_id: String,
    /// Zero-based batch index
    pub batch_index: u32,
    /// Total batches for this upload
    pub total_batches: u32,
    /// Consecutive terminal failures of this batch so far. Past the
    /// configured ceiling the job is marked permanently failed.
    #[serde(default)]
    pub consecutive_failures: u32,
    /// When the job was created
    pub created_at: DateTime<Utc>,
}

impl OcrBatchJob {
    pub fn new(
        upload_id: UploadId,
        user_id: impl Into<String>,
        batch_index: u32,
        total_batches: u32,
    ) -> Self {
        Self {
            job_id: JobId::new(),
            upload_id,
            user_id: user_id.into(),
            batch_index,
            total_batches,
            consecutive_failures: 0,
            created_at: Utc::now(),
        }
    }

    /// The follow-up job for the next batch, or `None` after the last.
    pub fn next_batch(&self) -> Option<OcrBatchJob> {
        if self.batch_index + 1 < self.total_batches {
            Some(OcrBatchJob::new(
                self.upload_id.clone(),
                self.user_id.clone(),
                self.batch_index + 1,
                self.total_batches,
            ))
        } else {
            None
        }
    }

    /// The same batch re-submitted after a terminal failure, with the
    /// failure counter bumped.
    pub fn retried(&self) -> OcrBatchJob {
        OcrBatchJob {
            job_id: JobId::new(),
            consecutive_failures: self.consecutive_failures + 1,
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Generate idempotency key for deduplication. The failure counter is
    /// part of the key so a retry re-enqueue is not rejected as a
    /// duplicate.
    pub fn idempotency_key(&self) -> String {
        format!(
            "ocr:{}:{}:{}:{}",
            self.user_id, self.upload_id, self.batch_index, self.consecutive_failures
        )
    }
}

/// Generic job wrapper for queue storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerJob {
    /// Full pipeline for one upload
    ProcessUpload(ProcessUploadJob),
    /// One OCR batch of an upload
    OcrBatch(OcrBatchJob),
}

impl WorkerJob {
    pub fn job_id(&self) -> &JobId {
        match self {
            WorkerJob::ProcessUpload(j) => &j.job_id,
            WorkerJob::OcrBatch(j) => &j.job_id,
        }
    }

    pub fn upload_id(&self) -> &UploadId {
        match self {
            WorkerJob::ProcessUpload(j) => &j.upload_id,
            WorkerJob::OcrBatch(j) => &j.upload_id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            WorkerJob::ProcessUpload(j) => &j.user_id,
            WorkerJob::OcrBatch(j) => &j.user_id,
        }
    }

    pub fn idempotency_key(&self) -> String {
        match self {
            WorkerJob::ProcessUpload(j) => j.idempotency_key(),
            WorkerJob::OcrBatch(j) => j.idempotency_key(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_job_serde_roundtrip() {
        let job = ProcessUploadJob::new(UploadId::from_string("u1"), "user-1", "uploads/u1.mp4");
        let wrapper = WorkerJob::ProcessUpload(job.clone());
        let json = serde_json::to_string(&wrapper).unwrap();
        let decoded: WorkerJob = serde_json::from_str(&json).unwrap();

        match decoded {
            WorkerJob::ProcessUpload(j) => {
                assert_eq!(j.job_id, job.job_id);
                assert_eq!(j.source_key, "uploads/u1.mp4");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_batch_chaining() {
        let batch = OcrBatchJob::new(UploadId::from_string("u1"), "user-1", 2, 4);
        let next = batch.next_batch().unwrap();
        assert_eq!(next.batch_index, 3);
        assert_eq!(next.consecutive_failures, 0);
        assert!(next.next_batch().is_none());
    }

    #[test]
    fn test_retry_bumps_failures_and_changes_key() {
        let batch = OcrBatchJob::new(UploadId::from_string("u1"), "user-1", 0, 4);
        let retried = batch.retried();
        assert_eq!(retried.batch_index, 0);
        assert_eq!(retried.consecutive_failures, 1);
        assert_ne!(batch.idempotency_key(), retried.idempotency_key());
    }

    #[test]
    fn test_old_payload_without_failure_counter_parses() {
        let json = format!(
            r#"{{"type":"ocr_batch","job_id":"{}","upload_id":"u1","user_id":"user-1","batch_index":1,"total_batches":3,"created_at":"2026-01-01T00:00:00Z"}}"#,
            JobId::new()
        );
        let decoded: WorkerJob = serde_json::from_str(&json).unwrap();
        match decoded {
            WorkerJob::OcrBatch(j) => assert_eq!(j.consecutive_failures, 0),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
