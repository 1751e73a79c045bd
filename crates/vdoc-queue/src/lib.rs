//! Redis Streams job queue and progress channel for the VDoc worker.

pub mod error;
pub mod job;
pub mod progress;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use job::{OcrBatchJob, ProcessUploadJob, WorkerJob};
pub use progress::{ProgressReporter, ProgressUpdate, ReporterConfig, StatusChannel};
pub use queue::{JobQueue, QueueConfig};
