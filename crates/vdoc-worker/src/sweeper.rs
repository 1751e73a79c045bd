//! Periodic maintenance: expired-checkpoint sweeping and scheduled-job
//! promotion.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use vdoc_checkpoint::CheckpointStore;
use vdoc_queue::JobQueue;

/// Loop until shutdown, sweeping expired checkpoints (with their blob
/// artifacts) and promoting due scheduled jobs onto the stream.
pub async fn run_sweeper(
    checkpoints: Arc<dyn CheckpointStore>,
    queue: Arc<JobQueue>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("Sweeper stopping");
                    return;
                }
            }
        }

        match checkpoints.sweep_expired().await {
            Ok(0) => {}
            Ok(swept) => info!("Swept {} expired checkpoints", swept),
            Err(e) => warn!("Checkpoint sweep failed: {}", e),
        }

        match queue.promote_due().await {
            Ok(0) => {}
            Ok(promoted) => debug!("Promoted {} scheduled jobs", promoted),
            Err(e) => warn!("Scheduled job promotion failed: {}", e),
        }
    }
}
