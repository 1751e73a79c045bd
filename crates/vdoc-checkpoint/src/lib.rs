//! Durable checkpoint store for resumable processing jobs.
//!
//! A job's progress through the pipeline lives in a
//! [`vdoc_models::ProcessingCheckpoint`] record. The store persists it
//! across restarts (Redis in production, process memory in dev), treats
//! expired records as absent, and garbage-collects blob artifacts when a
//! record is deleted or swept.

pub mod error;
pub mod memory;
pub mod redis;
pub mod store;

pub use error::{CheckpointError, CheckpointResult};
pub use memory::MemoryCheckpointStore;
pub use self::redis::{RedisCheckpointStore, RedisStoreConfig};
pub use store::{ArtifactStore, CheckpointStore, NullArtifactStore, SaveOptions};
