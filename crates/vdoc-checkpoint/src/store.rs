//! The checkpoint store contract.

use async_trait::async_trait;
use chrono::Duration;
use tracing::warn;
use vdoc_models::{ProcessingCheckpoint, UploadId};

use crate::error::{CheckpointError, CheckpointResult};

/// Options applied on every save.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    /// Bump the optimistic-concurrency version counter.
    pub increment_version: bool,
    /// Bump the retry counter (set when a relaunch follows an interruption).
    pub increment_retry: bool,
}

impl SaveOptions {
    /// The common case: a normal progress save.
    pub fn versioned() -> Self {
        Self {
            increment_version: true,
            increment_retry: false,
        }
    }

    /// Save marking an interrupted job so a relaunch can tell the
    /// difference from a fresh start.
    pub fn interrupted() -> Self {
        Self {
            increment_version: true,
            increment_retry: true,
        }
    }
}

/// Deletes blob artifacts referenced by a checkpoint. Implemented over
/// object storage in the worker; a no-op variant ships for dev/tests.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Delete the given blob keys, tolerating already-gone objects.
    /// Returns the number of keys handled.
    async fn delete_artifacts(&self, keys: &[String]) -> CheckpointResult<u32>;
}

/// Artifact store that deletes nothing. For dev mode and tests where no
/// blob storage is attached.
pub struct NullArtifactStore;

#[async_trait]
impl ArtifactStore for NullArtifactStore {
    async fn delete_artifacts(&self, keys: &[String]) -> CheckpointResult<u32> {
        Ok(keys.len() as u32)
    }
}

/// Durable record of job progress, keyed by upload id.
///
/// Backends: Redis for production, process memory for dev/tests. The
/// in-memory variant intentionally does not survive a restart.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load a checkpoint. A checkpoint past its expiry is treated as
    /// absent; the sweep will collect it later.
    async fn load(&self, id: &UploadId) -> CheckpointResult<Option<ProcessingCheckpoint>>;

    /// Persist a checkpoint, stamping `updated_at` and applying `options`
    /// to the in-memory copy before writing.
    async fn save(
        &self,
        checkpoint: &mut ProcessingCheckpoint,
        options: SaveOptions,
    ) -> CheckpointResult<()>;

    /// Read-modify-write: load the checkpoint, apply `mutate`, save with a
    /// version bump, and return the updated record. Fails with `NotFound`
    /// if the checkpoint is absent or expired.
    async fn update(
        &self,
        id: &UploadId,
        mutate: Box<dyn for<'a> FnOnce(&'a mut ProcessingCheckpoint) + Send>,
    ) -> CheckpointResult<ProcessingCheckpoint> {
        let mut checkpoint = self
            .load(id)
            .await?
            .ok_or_else(|| CheckpointError::not_found(id.as_str()))?;
        mutate(&mut checkpoint);
        self.save(&mut checkpoint, SaveOptions::versioned()).await?;
        Ok(checkpoint)
    }

    /// Delete a checkpoint and garbage-collect its blob artifacts.
    /// Cleanup failures are logged, never propagated; deleting an absent
    /// checkpoint is a no-op.
    async fn delete(&self, id: &UploadId) -> CheckpointResult<()>;

    /// Load an existing checkpoint or create a fresh one at the first
    /// pipeline step.
    async fn get_or_create(
        &self,
        id: &UploadId,
        user_id: &str,
    ) -> CheckpointResult<ProcessingCheckpoint>;

    /// Delete every checkpoint past its expiry, including blob artifacts.
    /// Returns the number of checkpoints removed.
    async fn sweep_expired(&self) -> CheckpointResult<u32>;
}

/// Best-effort artifact cleanup shared by the backends.
pub(crate) async fn collect_artifacts(
    artifacts: &dyn ArtifactStore,
    checkpoint: &ProcessingCheckpoint,
) {
    let keys = checkpoint.artifact_keys();
    if keys.is_empty() {
        return;
    }
    if let Err(e) = artifacts.delete_artifacts(&keys).await {
        warn!(
            upload_id = %checkpoint.upload_id,
            "Failed to delete checkpoint artifacts: {}",
            e
        );
    }
}

/// Checkpoint time-to-live used by `get_or_create` when minting a fresh
/// record.
pub fn default_ttl() -> Duration {
    Duration::days(7)
}
