//! Blob artifact garbage collection over object storage.

use async_trait::async_trait;
use tracing::debug;
use vdoc_checkpoint::{ArtifactStore, CheckpointError, CheckpointResult};
use vdoc_storage::ObjectStoreClient;

/// Deletes checkpoint blob artifacts from the object store. Already-gone
/// objects count as deleted.
pub struct StorageArtifactStore {
    client: ObjectStoreClient,
}

impl StorageArtifactStore {
    pub fn new(client: ObjectStoreClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArtifactStore for StorageArtifactStore {
    async fn delete_artifacts(&self, keys: &[String]) -> CheckpointResult<u32> {
        debug!("Garbage-collecting {} blob artifacts", keys.len());
        self.client
            .delete_objects(keys)
            .await
            .map_err(|e| CheckpointError::ArtifactCleanup(e.to_string()))
    }
}
