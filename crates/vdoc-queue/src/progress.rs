//! Job status events via Redis Pub/Sub.
//!
//! Status delivery is fire-and-forget: a monitoring layer that misses an
//! update learns the state from the next one, so publish failures are
//! logged and never fail the job.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vdoc_models::UploadId;

use crate::error::QueueResult;

/// One status update for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Upload the update belongs to
    pub upload_id: UploadId,
    /// Completion percent, 0-100
    pub percent: u8,
    /// Pipeline stage name
    pub stage: String,
    /// Optional human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Channel for publishing/subscribing to status updates.
pub struct StatusChannel {
    client: redis::Client,
}

impl StatusChannel {
    /// Create a new status channel.
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    /// Get the channel name for an upload.
    pub fn channel_name(upload_id: &UploadId) -> String {
        format!("vdoc:progress:{}", upload_id)
    }

    /// Publish a status update.
    pub async fn publish(&self, update: &ProgressUpdate) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let channel = Self::channel_name(&update.upload_id);
        let payload = serde_json::to_string(update)?;

        debug!("Publishing status update to {}", channel);
        conn.publish::<_, _, ()>(channel, payload).await?;

        Ok(())
    }

    /// Publish a terminal failure.
    pub async fn error(&self, upload_id: &UploadId, message: impl Into<String>) -> QueueResult<()> {
        self.publish(&ProgressUpdate {
            upload_id: upload_id.clone(),
            percent: 100,
            stage: "failed".to_string(),
            message: Some(message.into()),
        })
        .await
    }

    /// Publish completion.
    pub async fn done(&self, upload_id: &UploadId) -> QueueResult<()> {
        self.publish(&ProgressUpdate {
            upload_id: upload_id.clone(),
            percent: 100,
            stage: "done".to_string(),
            message: None,
        })
        .await
    }

    /// Subscribe to status updates for an upload.
    /// Returns a pinned stream that can be polled with `.next()`.
    pub async fn subscribe(
        &self,
        upload_id: &UploadId,
    ) -> QueueResult<std::pin::Pin<Box<dyn futures_util::Stream<Item = ProgressUpdate> + Send>>>
    {
        use futures_util::StreamExt;

        let mut pubsub = self.client.get_async_pubsub().await?;
        let channel = Self::channel_name(upload_id);

        pubsub.subscribe(&channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });

        Ok(Box::pin(stream))
    }
}

/// Throttling thresholds for [`ProgressReporter`].
#[derive(Debug, Clone, Copy)]
pub struct ReporterConfig {
    /// Minimum percent change before an update is published.
    pub min_percent_delta: u8,
    /// Minimum time between published updates.
    pub min_interval: std::time::Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            min_percent_delta: 5,
            min_interval: std::time::Duration::from_secs(2),
        }
    }
}

struct ReporterState {
    last_percent: Option<u8>,
    last_sent: Option<Instant>,
}

/// Per-job status reporter with built-in throttling.
///
/// `report` drops updates that moved less than the configured delta and
/// arrived inside the minimum interval; `force_report` always publishes.
/// Both swallow publish failures.
pub struct ProgressReporter {
    channel: Arc<StatusChannel>,
    upload_id: UploadId,
    config: ReporterConfig,
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new(channel: Arc<StatusChannel>, upload_id: UploadId) -> Self {
        Self::with_config(channel, upload_id, ReporterConfig::default())
    }

    pub fn with_config(
        channel: Arc<StatusChannel>,
        upload_id: UploadId,
        config: ReporterConfig,
    ) -> Self {
        Self {
            channel,
            upload_id,
            config,
            state: Mutex::new(ReporterState {
                last_percent: None,
                last_sent: None,
            }),
        }
    }

    fn should_send(&self, percent: u8) -> bool {
        let mut state = self.state.lock().unwrap();

        let passes = match (state.last_percent, state.last_sent) {
            (None, _) => true,
            (Some(last), Some(sent)) => {
                percent == 100
                    || percent.abs_diff(last) >= self.config.min_percent_delta
                    || sent.elapsed() >= self.config.min_interval
            }
            (Some(last), None) => percent == 100 || percent.abs_diff(last) >= self.config.min_percent_delta,
        };

        if passes {
            state.last_percent = Some(percent);
            state.last_sent = Some(Instant::now());
        }
        passes
    }

    /// Publish an update unless throttled.
    pub async fn report(&self, percent: u8, stage: &str, message: Option<String>) {
        if !self.should_send(percent) {
            return;
        }
        self.send(percent, stage, message).await;
    }

    /// Publish an update unconditionally.
    pub async fn force_report(&self, percent: u8, stage: &str, message: Option<String>) {
        {
            let mut state = self.state.lock().unwrap();
            state.last_percent = Some(percent);
            state.last_sent = Some(Instant::now());
        }
        self.send(percent, stage, message).await;
    }

    async fn send(&self, percent: u8, stage: &str, message: Option<String>) {
        let update = ProgressUpdate {
            upload_id: self.upload_id.clone(),
            percent,
            stage: stage.to_string(),
            message,
        };
        if let Err(e) = self.channel.publish(&update).await {
            warn!(upload_id = %self.upload_id, "Failed to publish status update: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn reporter() -> ProgressReporter {
        let channel = Arc::new(StatusChannel::new("redis://localhost:6379").unwrap());
        ProgressReporter::with_config(
            channel,
            UploadId::from_string("u1"),
            ReporterConfig {
                min_percent_delta: 5,
                min_interval: Duration::from_secs(60),
            },
        )
    }

    #[test]
    fn test_first_report_passes() {
        let r = reporter();
        assert!(r.should_send(0));
    }

    #[test]
    fn test_small_delta_is_throttled() {
        let r = reporter();
        assert!(r.should_send(10));
        assert!(!r.should_send(12));
        assert!(r.should_send(15));
    }

    #[test]
    fn test_completion_always_passes() {
        let r = reporter();
        assert!(r.should_send(98));
        assert!(r.should_send(100));
    }
}
