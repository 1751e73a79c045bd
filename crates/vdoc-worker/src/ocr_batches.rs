//! Batched scene OCR.
//!
//! Scenes are partitioned into fixed-size batches and each batch runs as
//! its own queue job: completing batch N persists its results and enqueues
//! batch N+1, so every batch gets a fresh delivery timeout and retry
//! budget. A batch either persists a result for every pending scene or is
//! retried as a whole; partially-persisted batches never exist.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use vdoc_checkpoint::CheckpointStore;
use vdoc_media::scene_detect::{build_scenes, SceneDetectConfig};
use vdoc_media::FfmpegRunner;
use vdoc_models::{batch_ranges, ProcessingCheckpoint, Scene, UploadId};
use vdoc_providers::ProviderRouter;
use vdoc_queue::{JobQueue, OcrBatchJob};
use vdoc_storage::ObjectStoreClient;

use crate::error::{WorkerError, WorkerResult};

/// Blob key for one scene's screenshot. Deterministic so the report
/// builder can reference screenshots without the checkpoint tracking
/// them.
pub fn scene_screenshot_key(user_id: &str, upload_id: &UploadId, scene_number: u32) -> String {
    format!(
        "users/{}/uploads/{}/scenes/scene-{:04}.jpg",
        user_id, upload_id, scene_number
    )
}

/// A scene's representative frame, extracted and (optionally) persisted.
pub struct SceneFrame {
    pub bytes: Vec<u8>,
    /// Blob key of the stored screenshot, when one was uploaded.
    pub screenshot_key: Option<String>,
}

/// Extracts the representative frame for a scene.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn frame(&self, scene: &Scene) -> WorkerResult<SceneFrame>;
}

/// Extracts frames from the job's local video via ffmpeg and uploads the
/// screenshot to object storage.
pub struct FfmpegFrameSource {
    runner: FfmpegRunner,
    video_path: std::path::PathBuf,
    scratch_dir: std::path::PathBuf,
    storage: ObjectStoreClient,
    user_id: String,
    upload_id: UploadId,
    /// Worker-wide cap on concurrent ffmpeg subprocesses.
    ffmpeg_slots: Arc<Semaphore>,
}

impl FfmpegFrameSource {
    pub fn new(
        runner: FfmpegRunner,
        video_path: impl Into<std::path::PathBuf>,
        scratch_dir: impl Into<std::path::PathBuf>,
        storage: ObjectStoreClient,
        user_id: impl Into<String>,
        upload_id: UploadId,
        ffmpeg_slots: Arc<Semaphore>,
    ) -> Self {
        Self {
            runner,
            video_path: video_path.into(),
            scratch_dir: scratch_dir.into(),
            storage,
            user_id: user_id.into(),
            upload_id,
            ffmpeg_slots,
        }
    }
}

#[async_trait]
impl FrameSource for FfmpegFrameSource {
    async fn frame(&self, scene: &Scene) -> WorkerResult<SceneFrame> {
        let out = self
            .scratch_dir
            .join(format!("scene-{:04}.jpg", scene.number));
        let bytes = {
            let _slot = self
                .ffmpeg_slots
                .acquire()
                .await
                .map_err(|_| WorkerError::job_failed("Worker shutting down"))?;
            vdoc_media::frames::extract_frame_bytes(
                &self.runner,
                &self.video_path,
                scene.sample_at,
                &out,
            )
            .await?
        };
        tokio::fs::remove_file(&out).await.ok();

        // Screenshot upload is best-effort: the report links the key
        // only for scenes that completed, and a re-run overwrites it.
        let key = scene_screenshot_key(&self.user_id, &self.upload_id, scene.number);
        let screenshot_key = match self
            .storage
            .upload_bytes(bytes.clone(), &key, "image/jpeg")
            .await
        {
            Ok(()) => Some(key),
            Err(e) => {
                warn!(scene = scene.number, "Screenshot upload failed: {}", e);
                None
            }
        };

        Ok(SceneFrame {
            bytes,
            screenshot_key,
        })
    }
}

/// Enqueues the follow-up batch job. Seam over the queue so batch logic
/// is testable without Redis.
#[async_trait]
pub trait BatchChain: Send + Sync {
    async fn enqueue(&self, job: OcrBatchJob) -> WorkerResult<()>;
}

/// Production chain backed by the Redis stream.
pub struct QueueBatchChain {
    queue: Arc<JobQueue>,
}

impl QueueBatchChain {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl BatchChain for QueueBatchChain {
    async fn enqueue(&self, job: OcrBatchJob) -> WorkerResult<()> {
        match self.queue.enqueue_ocr_batch(job).await {
            Ok(_) => Ok(()),
            // A redelivered predecessor already chained this batch.
            Err(e) if e.is_duplicate() => {
                debug!("Follow-up batch already enqueued");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Tuning for one batch run.
#[derive(Debug, Clone)]
pub struct OcrBatchConfig {
    pub batch_size: u32,
    pub frame_concurrency: usize,
    /// Consecutive terminal failures after which the batch's job is
    /// permanently failed instead of re-enqueued.
    pub max_batch_failures: u32,
}

impl Default for OcrBatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            frame_concurrency: 4,
            max_batch_failures: 3,
        }
    }
}

/// What happened to one batch job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchRunOutcome {
    /// Batch persisted, follow-up batch enqueued.
    NextEnqueued(u32),
    /// Batch persisted and it was the last one. The caller finishes the
    /// job (report, completion).
    AllBatchesDone,
    /// Batch failed as a whole and was re-enqueued with a bumped failure
    /// counter.
    Retried(u32),
    /// Batch failed and the failure ceiling is reached. The caller marks
    /// the job permanently failed.
    FailedPermanently,
}

/// Rebuild the published scene list from the checkpoint's persisted cuts.
///
/// Scene construction is deterministic given the cuts, the duration, and
/// the detection config, so batch jobs landing on any worker see the same
/// numbering.
pub fn rebuild_scenes(
    checkpoint: &ProcessingCheckpoint,
    config: &SceneDetectConfig,
) -> WorkerResult<Vec<Scene>> {
    let duration = checkpoint
        .video_duration
        .ok_or_else(|| WorkerError::job_failed("Checkpoint has no video duration"))?;
    Ok(build_scenes(
        &checkpoint.scene_cuts,
        duration,
        config.min_scene_duration_secs,
        config.sample_ratio,
    ))
}

/// Run one OCR batch job end to end: extract the pending frames, OCR them
/// through the router, persist the results, and chain the next step.
pub async fn run_ocr_batch(
    checkpoints: &dyn CheckpointStore,
    router: &ProviderRouter,
    frames: Arc<dyn FrameSource>,
    chain: &dyn BatchChain,
    scenes: &[Scene],
    job: &OcrBatchJob,
    config: &OcrBatchConfig,
) -> WorkerResult<BatchRunOutcome> {
    let checkpoint = checkpoints
        .load(&job.upload_id)
        .await?
        .ok_or_else(|| WorkerError::job_failed("Checkpoint vanished during OCR"))?;

    let total_scenes = checkpoint
        .total_scenes
        .ok_or_else(|| WorkerError::job_failed("Checkpoint has no scene count"))?;
    let video_duration = checkpoint.video_duration.unwrap_or(0.0);

    let batches = batch_ranges(total_scenes, config.batch_size);
    let batch = match batches.get(job.batch_index as usize) {
        Some(batch) => *batch,
        None => {
            warn!(
                batch = job.batch_index,
                total = batches.len(),
                "Batch index out of range, treating as complete"
            );
            return Ok(BatchRunOutcome::AllBatchesDone);
        }
    };

    let pending: Vec<Scene> = batch
        .scene_indices()
        .filter(|i| !checkpoint.completed_ocr_scenes.contains(i))
        .filter_map(|i| scenes.get(i as usize).cloned())
        .collect();

    info!(
        upload_id = %job.upload_id,
        batch = job.batch_index,
        scenes = batch.len(),
        pending = pending.len(),
        "Running OCR batch"
    );

    if !pending.is_empty() {
        match ocr_pending_scenes(router, frames, &pending, video_duration, config).await {
            Ok(results) => {
                checkpoints
                    .update(
                        &job.upload_id,
                        Box::new(move |cp| cp.merge_ocr_results(results)),
                    )
                    .await?;
            }
            Err(e) => {
                warn!(
                    upload_id = %job.upload_id,
                    batch = job.batch_index,
                    failures = job.consecutive_failures + 1,
                    "OCR batch failed: {}",
                    e
                );
                if job.consecutive_failures + 1 >= config.max_batch_failures {
                    return Ok(BatchRunOutcome::FailedPermanently);
                }
                chain.enqueue(job.retried()).await?;
                return Ok(BatchRunOutcome::Retried(job.consecutive_failures + 1));
            }
        }
    }

    match job.next_batch() {
        Some(next) => {
            let index = next.batch_index;
            chain.enqueue(next).await?;
            Ok(BatchRunOutcome::NextEnqueued(index))
        }
        None => Ok(BatchRunOutcome::AllBatchesDone),
    }
}

/// Extract and OCR every pending scene, or fail the whole batch. A scene
/// whose frame cannot be extracted or whose OCR failed on every provider
/// fails the batch; empty OCR text on a successful call is a valid result
/// (the frame simply has no text).
async fn ocr_pending_scenes(
    router: &ProviderRouter,
    frames: Arc<dyn FrameSource>,
    pending: &[Scene],
    video_duration: f64,
    config: &OcrBatchConfig,
) -> WorkerResult<Vec<(u32, String)>> {
    // A deployment with no OCR providers still produces a report; every
    // scene resolves to empty text rather than an endless retry loop.
    if router.provider_count() == 0 {
        warn!("No OCR providers configured, persisting empty results");
        return Ok(pending
            .iter()
            .map(|scene| (scene.index(), String::new()))
            .collect());
    }

    let semaphore = Arc::new(Semaphore::new(config.frame_concurrency.max(1)));
    let mut tasks: JoinSet<(usize, WorkerResult<SceneFrame>)> = JoinSet::new();

    for (slot, scene) in pending.iter().cloned().enumerate() {
        let frames = Arc::clone(&frames);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return (
                        slot,
                        Err(WorkerError::job_failed("Frame extraction cancelled")),
                    )
                }
            };
            (slot, frames.frame(&scene).await)
        });
    }

    let mut images: Vec<Option<Vec<u8>>> = vec![None; pending.len()];
    while let Some(joined) = tasks.join_next().await {
        let (slot, result) = joined
            .map_err(|e| WorkerError::job_failed(format!("Frame task panicked: {}", e)))?;
        let frame = result.map_err(|e| {
            WorkerError::job_failed(format!(
                "Frame extraction failed for scene {}: {}",
                pending[slot].number, e
            ))
        })?;
        images[slot] = Some(frame.bytes);
    }

    let items: Vec<Vec<u8>> = images.into_iter().flatten().collect();
    if items.len() != pending.len() {
        return Err(WorkerError::job_failed("Frame extraction incomplete"));
    }

    let outcome = router.process_parallel(items, video_duration).await;
    debug!(
        succeeded = outcome.stats.succeeded,
        failed = outcome.stats.failed,
        elapsed_ms = outcome.stats.elapsed_ms,
        "OCR batch round trip complete"
    );
    if outcome.stats.failed > 0 {
        return Err(WorkerError::job_failed(format!(
            "{} of {} scenes failed on every provider",
            outcome.stats.failed,
            pending.len()
        )));
    }

    Ok(pending
        .iter()
        .zip(outcome.results)
        .map(|(scene, output)| (scene.index(), output.text))
        .collect())
}
