//! The video analysis worker.
//!
//! Consumes jobs from the Redis stream and runs the processing pipeline:
//! download, audio extraction, VAD-gated transcription in parallel with
//! scene detection, chained OCR batches, and report assembly. Progress is
//! checkpointed throughout so any step resumes after a crash or restart.

pub mod artifacts;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod logging;
pub mod ocr_batches;
pub mod pipeline;
pub mod report;
pub mod retry;
pub mod sweeper;
pub mod transcription;

pub use config::WorkerConfig;
pub use context::ProcessingContext;
pub use error::{WorkerError, WorkerResult};
pub use executor::JobExecutor;
