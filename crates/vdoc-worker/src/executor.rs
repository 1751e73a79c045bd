//! Job executor.
//!
//! Consumes jobs from the Redis stream under a concurrency cap, claims
//! stale deliveries from crashed workers, and routes each job through the
//! pipeline. Failed deliveries are retried up to the queue's budget, then
//! moved to the DLQ with a terminal status published. On graceful
//! shutdown, checkpoints of still-running jobs are stamped as interrupted
//! so the relaunch can tell resumption from a fresh start.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vdoc_checkpoint::SaveOptions;
use vdoc_models::UploadId;
use vdoc_queue::WorkerJob;

use crate::context::ProcessingContext;
use crate::error::{WorkerError, WorkerResult};
use crate::pipeline::{process_ocr_batch, process_upload};

/// Job executor that processes jobs from the queue.
pub struct JobExecutor {
    ctx: Arc<ProcessingContext>,
    job_semaphore: Arc<Semaphore>,
    shutdown: tokio::sync::watch::Sender<bool>,
    consumer_name: String,
    /// Uploads with a job currently running, for interrupted-save on
    /// shutdown.
    active: Arc<Mutex<HashSet<UploadId>>>,
}

impl JobExecutor {
    pub fn new(ctx: Arc<ProcessingContext>) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(ctx.config.max_concurrent_jobs));
        let (shutdown, _) = tokio::sync::watch::channel(false);
        let consumer_name = format!("worker-{}", Uuid::new_v4());

        Self {
            ctx,
            job_semaphore,
            shutdown,
            consumer_name,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// A receiver other tasks (the sweeper) can watch for shutdown.
    pub fn shutdown_receiver(&self) -> tokio::sync::watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Run until shutdown is signalled.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting job executor '{}' with {} max concurrent jobs",
            self.consumer_name, self.ctx.config.max_concurrent_jobs
        );

        self.ctx.queue.init().await?;

        let mut shutdown_rx = self.shutdown.subscribe();
        let claim_task = self.spawn_claim_task();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume_jobs() => {
                    if let Err(e) = result {
                        error!("Error consuming jobs: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        claim_task.abort();

        info!("Waiting for in-flight jobs to complete...");
        let drained = tokio::time::timeout(self.ctx.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_ok();
        if !drained {
            self.mark_active_interrupted().await;
        }

        info!("Job executor stopped");
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Periodically claim deliveries left pending by crashed workers.
    fn spawn_claim_task(&self) -> tokio::task::JoinHandle<()> {
        let ctx = Arc::clone(&self.ctx);
        let consumer_name = self.consumer_name.clone();
        let semaphore = Arc::clone(&self.job_semaphore);
        let active = Arc::clone(&self.active);
        let mut shutdown_rx = self.shutdown.subscribe();
        let claim_interval = self.ctx.config.claim_interval;
        let min_idle_ms = self.ctx.config.claim_min_idle.as_millis() as u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(claim_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match ctx.queue.claim_pending(&consumer_name, min_idle_ms, 5).await {
                            Ok(jobs) if !jobs.is_empty() => {
                                info!("Claimed {} pending jobs", jobs.len());
                                for (message_id, job) in jobs {
                                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await
                                    else {
                                        return;
                                    };
                                    let ctx = Arc::clone(&ctx);
                                    let active = Arc::clone(&active);
                                    tokio::spawn(async move {
                                        let _permit = permit;
                                        Self::execute_job(ctx, active, message_id, job).await;
                                    });
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Failed to claim pending jobs: {}", e),
                        }
                    }
                }
            }
        })
    }

    /// Consume new deliveries, up to the free job slots.
    async fn consume_jobs(&self) -> WorkerResult<()> {
        let available = self.job_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let jobs = self
            .ctx
            .queue
            .consume(&self.consumer_name, 1000, available.min(5))
            .await?;
        if jobs.is_empty() {
            return Ok(());
        }

        debug!("Consumed {} jobs from queue", jobs.len());

        for (message_id, job) in jobs {
            let permit = Arc::clone(&self.job_semaphore)
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::job_failed("Semaphore closed"))?;
            let ctx = Arc::clone(&self.ctx);
            let active = Arc::clone(&self.active);

            tokio::spawn(async move {
                let _permit = permit;
                Self::execute_job(ctx, active, message_id, job).await;
            });
        }

        Ok(())
    }

    /// Execute one delivery with ack, retry, and DLQ handling.
    async fn execute_job(
        ctx: Arc<ProcessingContext>,
        active: Arc<Mutex<HashSet<UploadId>>>,
        message_id: String,
        job: WorkerJob,
    ) {
        let job_id = job.job_id().to_string();
        let upload_id = job.upload_id().clone();
        info!("Executing job {} for upload {}", job_id, upload_id);

        active.lock().unwrap().insert(upload_id.clone());
        let result = Self::dispatch(&ctx, &job).await;
        active.lock().unwrap().remove(&upload_id);

        match result {
            Ok(()) => {
                info!("Job {} completed successfully", job_id);
                if let Err(e) = ctx.queue.ack(&message_id).await {
                    error!("Failed to ack job {}: {}", job_id, e);
                }
                if let Err(e) = ctx.queue.clear_dedup(&job).await {
                    warn!("Failed to clear dedup key for job {}: {}", job_id, e);
                }
            }
            Err(e) if e.is_fatal_input() => {
                // Bad input cannot succeed on redelivery. Straight to the
                // DLQ; the checkpoint delete garbage-collects the blobs.
                error!("Job {} failed on invalid input: {}", job_id, e);
                Self::bury(&ctx, &message_id, &job, &e).await;
            }
            Err(e) => {
                error!("Job {} failed: {}", job_id, e);
                let retry_count = ctx.queue.increment_retry(&message_id).await.unwrap_or(999);
                let max_retries = ctx.queue.max_retries();

                if retry_count >= max_retries {
                    warn!(
                        "Job {} exceeded max retries ({}), moving to DLQ",
                        job_id, max_retries
                    );
                    Self::bury(&ctx, &message_id, &job, &e).await;
                } else {
                    info!(
                        "Job {} will be redelivered (attempt {}/{})",
                        job_id, retry_count, max_retries
                    );
                }
            }
        }
    }

    /// Terminal failure: DLQ the delivery, free the dedup key, publish the
    /// failure, and drop the checkpoint with its blob artifacts.
    async fn bury(ctx: &ProcessingContext, message_id: &str, job: &WorkerJob, e: &WorkerError) {
        let job_id = job.job_id().to_string();
        if let Err(dlq_err) = ctx.queue.dlq(message_id, job, &e.to_string()).await {
            error!("Failed to move job {} to DLQ: {}", job_id, dlq_err);
        }
        if let Err(clear_err) = ctx.queue.clear_dedup(job).await {
            warn!("Failed to clear dedup key for job {}: {}", job_id, clear_err);
        }
        ctx.status
            .error(job.upload_id(), format!("Job failed: {}", e))
            .await
            .ok();
        if let Err(del_err) = ctx.checkpoints.delete(job.upload_id()).await {
            warn!(
                "Failed to delete checkpoint for upload {}: {}",
                job.upload_id(),
                del_err
            );
        }
    }

    async fn dispatch(ctx: &Arc<ProcessingContext>, job: &WorkerJob) -> WorkerResult<()> {
        match job {
            WorkerJob::ProcessUpload(j) => {
                tokio::time::timeout(ctx.config.job_timeout, process_upload(ctx, j))
                    .await
                    .map_err(|_| WorkerError::job_failed("Job timed out"))?
            }
            WorkerJob::OcrBatch(j) => {
                tokio::time::timeout(ctx.config.job_timeout, process_ocr_batch(ctx, j))
                    .await
                    .map_err(|_| WorkerError::job_failed("Job timed out"))?
            }
        }
    }

    /// Wait until every job slot is free again.
    async fn wait_for_jobs(&self) {
        loop {
            if self.job_semaphore.available_permits() == self.ctx.config.max_concurrent_jobs {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Stamp checkpoints of jobs still running at shutdown so the next
    /// delivery knows it follows an interruption.
    async fn mark_active_interrupted(&self) {
        let uploads: Vec<UploadId> = self.active.lock().unwrap().iter().cloned().collect();
        if uploads.is_empty() {
            return;
        }
        warn!(
            "{} jobs still active at shutdown, marking checkpoints interrupted",
            uploads.len()
        );
        for upload_id in uploads {
            match self.ctx.checkpoints.load(&upload_id).await {
                Ok(Some(mut checkpoint)) => {
                    if let Err(e) = self
                        .ctx
                        .checkpoints
                        .save(&mut checkpoint, SaveOptions::interrupted())
                        .await
                    {
                        warn!(upload_id = %upload_id, "Interrupted save failed: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(upload_id = %upload_id, "Failed to load checkpoint: {}", e),
            }
        }
    }
}
