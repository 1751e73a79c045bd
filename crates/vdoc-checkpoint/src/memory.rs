//! In-memory checkpoint store for dev mode and tests.
//!
//! Deliberately does not persist across restarts: running without the
//! durable backend means no resume support, and that should be visible.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;
use vdoc_models::{ProcessingCheckpoint, UploadId};

use crate::error::CheckpointResult;
use crate::store::{
    collect_artifacts, default_ttl, ArtifactStore, CheckpointStore, NullArtifactStore, SaveOptions,
};

/// Process-local checkpoint store.
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<String, ProcessingCheckpoint>>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl MemoryCheckpointStore {
    pub fn new(artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            artifacts,
        }
    }

    /// Number of live records, for tests.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new(Arc::new(NullArtifactStore))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, id: &UploadId) -> CheckpointResult<Option<ProcessingCheckpoint>> {
        let records = self.records.lock().await;
        Ok(records
            .get(id.as_str())
            .filter(|cp| !cp.is_expired())
            .cloned())
    }

    async fn save(
        &self,
        checkpoint: &mut ProcessingCheckpoint,
        options: SaveOptions,
    ) -> CheckpointResult<()> {
        checkpoint.updated_at = Utc::now();
        if options.increment_version {
            checkpoint.version += 1;
        }
        if options.increment_retry {
            checkpoint.retry_count += 1;
        }

        let mut records = self.records.lock().await;
        records.insert(checkpoint.upload_id.as_str().to_string(), checkpoint.clone());
        Ok(())
    }

    async fn delete(&self, id: &UploadId) -> CheckpointResult<()> {
        let removed = {
            let mut records = self.records.lock().await;
            records.remove(id.as_str())
        };
        if let Some(checkpoint) = removed {
            collect_artifacts(self.artifacts.as_ref(), &checkpoint).await;
            debug!(upload_id = %id, "Deleted checkpoint");
        }
        Ok(())
    }

    async fn get_or_create(
        &self,
        id: &UploadId,
        user_id: &str,
    ) -> CheckpointResult<ProcessingCheckpoint> {
        if let Some(existing) = self.load(id).await? {
            return Ok(existing);
        }
        let mut fresh = ProcessingCheckpoint::new(id.clone(), user_id, default_ttl());
        self.save(&mut fresh, SaveOptions::default()).await?;
        Ok(fresh)
    }

    async fn sweep_expired(&self) -> CheckpointResult<u32> {
        let expired: Vec<ProcessingCheckpoint> = {
            let mut records = self.records.lock().await;
            let ids: Vec<String> = records
                .iter()
                .filter(|(_, cp)| cp.is_expired())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| records.remove(id)).collect()
        };

        for checkpoint in &expired {
            collect_artifacts(self.artifacts.as_ref(), checkpoint).await;
        }
        Ok(expired.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vdoc_models::ProcessingStep;

    struct RecordingArtifacts {
        deleted: AtomicU32,
    }

    #[async_trait]
    impl ArtifactStore for RecordingArtifacts {
        async fn delete_artifacts(&self, keys: &[String]) -> CheckpointResult<u32> {
            self.deleted.fetch_add(keys.len() as u32, Ordering::SeqCst);
            Ok(keys.len() as u32)
        }
    }

    fn upload(id: &str) -> UploadId {
        UploadId::from_string(id)
    }

    #[tokio::test]
    async fn test_get_or_create_then_load() {
        let store = MemoryCheckpointStore::default();
        let id = upload("job-1");

        let created = store.get_or_create(&id, "user-1").await.unwrap();
        assert_eq!(created.current_step, ProcessingStep::Downloading);

        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.user_id, "user-1");

        // Second call returns the existing record, not a fresh one.
        let again = store.get_or_create(&id, "user-1").await.unwrap();
        assert_eq!(again.version, loaded.version);
    }

    #[tokio::test]
    async fn test_save_bumps_version_and_retry() {
        let store = MemoryCheckpointStore::default();
        let id = upload("job-2");
        let mut cp = store.get_or_create(&id, "user-1").await.unwrap();

        store.save(&mut cp, SaveOptions::versioned()).await.unwrap();
        assert_eq!(cp.version, 1);
        assert_eq!(cp.retry_count, 0);

        store.save(&mut cp, SaveOptions::interrupted()).await.unwrap();
        assert_eq!(cp.version, 2);
        assert_eq!(cp.retry_count, 1);
    }

    #[tokio::test]
    async fn test_update_fails_when_absent() {
        let store = MemoryCheckpointStore::default();
        let err = store
            .update(&upload("nope"), Box::new(|_| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::CheckpointError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_applies_mutation() {
        let store = MemoryCheckpointStore::default();
        let id = upload("job-3");
        store.get_or_create(&id, "user-1").await.unwrap();

        let updated = store
            .update(
                &id,
                Box::new(|cp| cp.advance_to(ProcessingStep::Transcription)),
            )
            .await
            .unwrap();
        assert_eq!(updated.current_step, ProcessingStep::Transcription);

        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.current_step, ProcessingStep::Transcription);
    }

    #[tokio::test]
    async fn test_expired_checkpoint_is_absent() {
        let store = MemoryCheckpointStore::default();
        let id = upload("job-4");
        let mut cp = store.get_or_create(&id, "user-1").await.unwrap();
        cp.expires_at = Utc::now() - Duration::seconds(1);
        store.save(&mut cp, SaveOptions::default()).await.unwrap();

        assert!(store.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_collects_expired_and_artifacts() {
        let artifacts = Arc::new(RecordingArtifacts {
            deleted: AtomicU32::new(0),
        });
        let store = MemoryCheckpointStore::new(artifacts.clone());

        let mut live = store.get_or_create(&upload("live"), "u").await.unwrap();
        live.video_key = Some("uploads/live/video.mp4".into());
        store.save(&mut live, SaveOptions::default()).await.unwrap();

        let mut dead = store.get_or_create(&upload("dead"), "u").await.unwrap();
        dead.video_key = Some("uploads/dead/video.mp4".into());
        dead.audio_key = Some("uploads/dead/audio.wav".into());
        dead.expires_at = Utc::now() - Duration::seconds(1);
        store.save(&mut dead, SaveOptions::default()).await.unwrap();

        let swept = store.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
        assert_eq!(store.len().await, 1);
        assert_eq!(artifacts.deleted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_delete_collects_artifacts_and_is_idempotent() {
        let artifacts = Arc::new(RecordingArtifacts {
            deleted: AtomicU32::new(0),
        });
        let store = MemoryCheckpointStore::new(artifacts.clone());
        let id = upload("job-5");

        let mut cp = store.get_or_create(&id, "u").await.unwrap();
        cp.audio_key = Some("uploads/job-5/audio.wav".into());
        store.save(&mut cp, SaveOptions::default()).await.unwrap();

        store.delete(&id).await.unwrap();
        assert!(store.load(&id).await.unwrap().is_none());
        assert_eq!(artifacts.deleted.load(Ordering::SeqCst), 1);

        // Deleting again is a no-op.
        store.delete(&id).await.unwrap();
        assert_eq!(artifacts.deleted.load(Ordering::SeqCst), 1);
    }
}
