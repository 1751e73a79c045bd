//! Redis-backed checkpoint store.
//!
//! One JSON record per checkpoint plus an index set used by the expiry
//! sweep. Records carry no Redis TTL: expiry is handled by the sweep so
//! blob artifacts are garbage-collected before the record disappears.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use tracing::{debug, info, warn};
use vdoc_models::{ProcessingCheckpoint, UploadId};

use crate::error::{CheckpointError, CheckpointResult};
use crate::store::{collect_artifacts, default_ttl, ArtifactStore, CheckpointStore, SaveOptions};

/// Configuration for the Redis checkpoint store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis URL
    pub redis_url: String,
    /// Key prefix for checkpoint records
    pub key_prefix: String,
    /// Index set holding all checkpoint ids
    pub index_key: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "vdoc:checkpoint:".to_string(),
            index_key: "vdoc:checkpoints".to_string(),
        }
    }
}

impl RedisStoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            ..Self::default()
        }
    }
}

/// Checkpoint store backed by Redis.
pub struct RedisCheckpointStore {
    client: redis::Client,
    config: RedisStoreConfig,
    artifacts: Arc<dyn ArtifactStore>,
}

impl RedisCheckpointStore {
    /// Create a new store.
    pub fn new(
        config: RedisStoreConfig,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> CheckpointResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            artifacts,
        })
    }

    /// Create from environment variables.
    pub fn from_env(artifacts: Arc<dyn ArtifactStore>) -> CheckpointResult<Self> {
        Self::new(RedisStoreConfig::from_env(), artifacts)
    }

    fn record_key(&self, id: &UploadId) -> String {
        format!("{}{}", self.config.key_prefix, id.as_str())
    }

    async fn load_raw(&self, id: &UploadId) -> CheckpointResult<Option<ProcessingCheckpoint>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(self.record_key(id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn remove_record(&self, id: &UploadId) -> CheckpointResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(self.record_key(id)).await?;
        conn.srem::<_, _, ()>(&self.config.index_key, id.as_str())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn load(&self, id: &UploadId) -> CheckpointResult<Option<ProcessingCheckpoint>> {
        match self.load_raw(id).await? {
            Some(cp) if cp.is_expired() => {
                debug!(upload_id = %id, "Checkpoint expired, treating as absent");
                Ok(None)
            }
            other => Ok(other),
        }
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

        let json = serde_json::to_string(checkpoint)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set::<_, _, ()>(self.record_key(&checkpoint.upload_id), json)
            .await?;
        conn.sadd::<_, _, ()>(&self.config.index_key, checkpoint.upload_id.as_str())
            .await?;

        debug!(
            upload_id = %checkpoint.upload_id,
            step = %checkpoint.current_step,
            version = checkpoint.version,
            "Saved checkpoint"
        );
        Ok(())
    }

    async fn delete(&self, id: &UploadId) -> CheckpointResult<()> {
        if let Some(checkpoint) = self.load_raw(id).await? {
            collect_artifacts(self.artifacts.as_ref(), &checkpoint).await;
        }
        self.remove_record(id).await?;
        debug!(upload_id = %id, "Deleted checkpoint");
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
        info!(upload_id = %id, "Created checkpoint");
        Ok(fresh)
    }

    async fn sweep_expired(&self) -> CheckpointResult<u32> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let ids: Vec<String> = conn.smembers(&self.config.index_key).await?;
        drop(conn);

        let mut swept = 0;
        for raw_id in ids {
            let id = UploadId::from_string(&raw_id);
            match self.load_raw(&id).await {
                Ok(Some(checkpoint)) if checkpoint.is_expired() => {
                    collect_artifacts(self.artifacts.as_ref(), &checkpoint).await;
                    self.remove_record(&id).await?;
                    swept += 1;
                }
                Ok(Some(_)) => {}
                // Record vanished from under the index entry.
                Ok(None) => self.remove_record(&id).await?,
                Err(CheckpointError::Json(e)) => {
                    warn!(upload_id = %id, "Sweeping unparseable checkpoint: {}", e);
                    self.remove_record(&id).await?;
                    swept += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if swept > 0 {
            info!("Swept {} expired checkpoints", swept);
        }
        Ok(swept)
    }
}
