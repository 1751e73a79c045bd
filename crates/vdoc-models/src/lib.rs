//! Shared data models for the VDoc analysis worker.
//!
//! This crate provides Serde-serializable types for:
//! - Upload/job identifiers
//! - The pipeline step state machine
//! - Processing checkpoints and transcription segments
//! - Scene cuts, scenes, and OCR batches
//! - Capability (OCR/ASR) call results
//! - Report rows and summaries

pub mod checkpoint;
pub mod job;
pub mod provider;
pub mod report;
pub mod scene;
pub mod step;
pub mod timecode;

// Re-export common types
pub use checkpoint::{ProcessingCheckpoint, Segment};
pub use job::{JobId, UploadId};
pub use provider::{CapabilityKind, CapabilityOutput, RawSegment};
pub use report::{ReportRow, ReportSummary, NO_TEXT_MARKER};
pub use scene::{batch_ranges, Cut, CutSource, Scene, SceneBatch};
pub use step::ProcessingStep;
pub use timecode::format_timecode;
