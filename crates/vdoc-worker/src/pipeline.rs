//! The processing pipeline for one upload.
//!
//! A `ProcessUpload` job carries the upload through download, audio
//! extraction, parallel transcription and scene detection, then hands off
//! to the chained OCR batch jobs. Every step boundary is checkpointed, so
//! a redelivery resumes where the last attempt stopped instead of redoing
//! finished work.
//!
//! Failure policy: transcription is an enrichment and degrades to an
//! empty transcript; scene detection produces the report's backbone and
//! its failure fails the job.

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{warn, Instrument};
use vdoc_media::scene_detect::SceneDetectConfig;
use vdoc_media::voiced::{analyze_voiced, VoicedConfig};
use vdoc_media::{detect_scenes, probe_video};
use vdoc_models::{batch_ranges, ProcessingCheckpoint, ProcessingStep, UploadId};
use vdoc_queue::{OcrBatchJob, ProcessUploadJob, ProgressReporter, ProgressUpdate, StatusChannel};
use vdoc_storage::download::{download_large_object, DownloadConfig};

use crate::context::ProcessingContext;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::ocr_batches::{
    rebuild_scenes, run_ocr_batch, BatchRunOutcome, FfmpegFrameSource, OcrBatchConfig,
    QueueBatchChain,
};
use crate::report::{build_rows, build_summary};
use crate::retry::FailureTracker;
use crate::transcription::{transcribe_chunks, FfmpegChunkSource, TranscriptionConfig};

/// Last reported completion percent, shared with the heartbeat task.
#[derive(Default)]
struct ProgressState {
    percent: AtomicU8,
}

/// Background task that republishes the current percent periodically so
/// monitors can tell a slow job from a dead one. Aborted on drop.
struct Heartbeat {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn spawn_heartbeat(
    status: Arc<StatusChannel>,
    upload_id: UploadId,
    state: Arc<ProgressState>,
    interval: Duration,
) -> Heartbeat {
    let handle = tokio::spawn(async move {
        let mut failures = FailureTracker::new(3);
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let update = ProgressUpdate {
                upload_id: upload_id.clone(),
                percent: state.percent.load(Ordering::Relaxed),
                stage: "processing".to_string(),
                message: Some("heartbeat".to_string()),
            };
            match status.publish(&update).await {
                Ok(()) => failures.record_success(),
                Err(e) => {
                    if failures.record_failure() {
                        warn!(upload_id = %update.upload_id, "Heartbeat publish failed: {}", e);
                    }
                }
            }
        }
    });
    Heartbeat { handle }
}

async fn report_stage(
    reporter: &ProgressReporter,
    state: &ProgressState,
    percent: u8,
    stage: &str,
) {
    state.percent.store(percent, Ordering::Relaxed);
    reporter.report(percent, stage, None).await;
}

/// Run a `ProcessUpload` job. The local scratch directory is removed on
/// both success and failure; durable state lives in the checkpoint.
pub async fn process_upload(ctx: &ProcessingContext, job: &ProcessUploadJob) -> WorkerResult<()> {
    let logger = JobLogger::new(&job.upload_id, "process_upload");
    let dir = ctx.job_dir(job.upload_id.as_str());

    let result = run_upload(ctx, job, &logger, &dir)
        .instrument(logger.create_span())
        .await;

    cleanup_dir(&dir).await;
    if let Err(e) = &result {
        logger.log_error(&format!("Pipeline failed: {}", e));
    }
    result
}

async fn run_upload(
    ctx: &ProcessingContext,
    job: &ProcessUploadJob,
    logger: &JobLogger,
    dir: &Path,
) -> WorkerResult<()> {
    tokio::fs::create_dir_all(dir).await?;

    let mut checkpoint = ctx
        .checkpoints
        .get_or_create(&job.upload_id, &job.user_id)
        .await?;
    if checkpoint.retry_count > 0 || checkpoint.version > 0 {
        logger.log_progress(&format!(
            "Resuming at step {} (version {}, {} relaunches)",
            checkpoint.current_step, checkpoint.version, checkpoint.retry_count
        ));
    } else {
        logger.log_start("Processing upload");
    }

    let reporter = Arc::new(ProgressReporter::new(
        Arc::clone(&ctx.status),
        job.upload_id.clone(),
    ));
    let state = Arc::new(ProgressState::default());
    let _heartbeat = spawn_heartbeat(
        Arc::clone(&ctx.status),
        job.upload_id.clone(),
        Arc::clone(&state),
        ctx.config.heartbeat_interval,
    );

    let video_path = dir.join("video.mp4");
    let audio_path = dir.join("audio.wav");

    // Download.
    if checkpoint.current_step.should_run(ProcessingStep::Downloading) {
        report_stage(&reporter, &state, 5, "downloading").await;
        download_large_object(
            &ctx.storage,
            &job.source_key,
            &video_path,
            &DownloadConfig::default(),
        )
        .await?;

        let info = probe_video(&video_path).await?;
        if info.duration <= 0.0 {
            return Err(WorkerError::invalid_input("Video has zero duration"));
        }
        logger.log_progress(&format!(
            "Downloaded {}x{} video, {:.1}s",
            info.width, info.height, info.duration
        ));

        let source_key = job.source_key.clone();
        checkpoint = ctx
            .checkpoints
            .update(
                &job.upload_id,
                Box::new(move |cp| {
                    cp.video_key = Some(source_key);
                    cp.video_duration = Some(info.duration);
                    cp.advance_to(ProcessingStep::AudioExtraction);
                }),
            )
            .await?;
    } else {
        ensure_local_video(ctx, &checkpoint, &job.source_key, &video_path).await?;
    }

    let duration = checkpoint
        .video_duration
        .ok_or_else(|| WorkerError::job_failed("Checkpoint has no video duration"))?;

    // Audio extraction.
    if checkpoint
        .current_step
        .should_run(ProcessingStep::AudioExtraction)
    {
        report_stage(&reporter, &state, 15, "audio_extraction").await;
        let info = probe_video(&video_path).await?;

        let audio_key = if info.has_audio {
            vdoc_media::audio::extract_audio(&ctx.runner, &video_path, &audio_path).await?;
            let key = format!("users/{}/uploads/{}/audio.wav", job.user_id, job.upload_id);
            ctx.storage
                .upload_file(&audio_path, &key, "audio/wav")
                .await?;
            Some(key)
        } else {
            logger.log_warning("No audio track, transcription will be skipped");
            None
        };

        checkpoint = ctx
            .checkpoints
            .update(
                &job.upload_id,
                Box::new(move |cp| {
                    cp.audio_key = audio_key;
                    cp.advance_to(ProcessingStep::Transcription);
                }),
            )
            .await?;
    }

    // Transcription and scene detection run concurrently; they touch
    // disjoint checkpoint fields and different input files.
    let need_transcription = checkpoint
        .current_step
        .should_run(ProcessingStep::Transcription)
        && checkpoint.audio_key.is_some();
    let need_scenes = checkpoint
        .current_step
        .should_run(ProcessingStep::SceneDetection);

    if need_transcription {
        ensure_local_audio(ctx, &checkpoint, &audio_path).await?;
    }

    let transcription = async {
        if !need_transcription {
            return Ok::<(), WorkerError>(());
        }
        let Some(gateway) = ctx.asr.clone() else {
            warn!(upload_id = %job.upload_id, "No ASR provider configured, skipping transcription");
            return Ok(());
        };

        report_stage(&reporter, &state, 30, "transcription").await;
        let analysis =
            analyze_voiced(&ctx.runner, &audio_path, duration, &VoicedConfig::default()).await?;

        let total_chunks = analysis.chunks.len() as u32;
        let voice_ratio = analysis.voice_ratio();
        let savings = analysis.estimated_savings_secs();
        ctx.checkpoints
            .update(
                &job.upload_id,
                Box::new(move |cp| {
                    cp.total_audio_chunks = Some(total_chunks);
                    cp.voice_ratio = Some(voice_ratio);
                    cp.estimated_savings_secs = Some(savings);
                }),
            )
            .await?;

        let source = Arc::new(FfmpegChunkSource::new(
            ctx.runner.clone(),
            &audio_path,
            dir,
            Arc::clone(&ctx.ffmpeg_slots),
        ));
        transcribe_chunks(
            ctx.checkpoints.as_ref(),
            gateway,
            source,
            &job.upload_id,
            &analysis,
            &TranscriptionConfig {
                concurrency: ctx.config.chunk_concurrency,
                checkpoint_interval: ctx.config.chunk_checkpoint_interval,
            },
        )
        .await?;
        Ok(())
    };

    let scene_detection = async {
        if !need_scenes {
            return Ok::<Option<vdoc_media::SceneDetection>, WorkerError>(None);
        }
        report_stage(&reporter, &state, 40, "scene_detection").await;
        let detection =
            detect_scenes(&ctx.runner, &video_path, duration, &SceneDetectConfig::default())
                .await?;
        Ok(Some(detection))
    };

    let (transcription_result, detection) = tokio::join!(transcription, scene_detection);

    // A lost transcript degrades the report's narration column; it does
    // not lose the scenes, OCR, or the report itself.
    if let Err(e) = transcription_result {
        logger.log_warning(&format!(
            "Transcription failed, continuing without narration: {}",
            e
        ));
    }

    if let Some(detection) = detection? {
        let cuts = detection.cuts;
        let total_scenes = detection.scenes.len() as u32;
        logger.log_progress(&format!("Detected {} scenes", total_scenes));
        checkpoint = ctx
            .checkpoints
            .update(
                &job.upload_id,
                Box::new(move |cp| {
                    cp.scene_cuts = cuts;
                    cp.total_scenes = Some(total_scenes);
                    cp.advance_to(ProcessingStep::Ocr);
                }),
            )
            .await?;
    } else {
        checkpoint = ctx
            .checkpoints
            .load(&job.upload_id)
            .await?
            .ok_or_else(|| WorkerError::job_failed("Checkpoint vanished mid-pipeline"))?;
    }

    // Hand off to the OCR batch chain (or straight to the report when
    // every scene is already cached from a previous attempt).
    if checkpoint.current_step.should_run(ProcessingStep::Ocr) {
        let total_scenes = checkpoint
            .total_scenes
            .ok_or_else(|| WorkerError::job_failed("Checkpoint has no scene count"))?;
        let batches = batch_ranges(total_scenes, ctx.config.ocr_batch_size);
        let first_incomplete = batches.iter().find(|b| {
            b.scene_indices()
                .any(|i| !checkpoint.completed_ocr_scenes.contains(&i))
        });

        match first_incomplete {
            Some(batch) => {
                report_stage(&reporter, &state, 60, "ocr").await;
                let batch_job = OcrBatchJob::new(
                    job.upload_id.clone(),
                    job.user_id.clone(),
                    batch.index,
                    batches.len() as u32,
                );
                match ctx.queue.enqueue_ocr_batch(batch_job).await {
                    Ok(_) => logger.log_progress(&format!(
                        "Enqueued OCR batch {}/{}",
                        batch.index + 1,
                        batches.len()
                    )),
                    Err(e) if e.is_duplicate() => {
                        logger.log_progress("OCR batch already enqueued")
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            None => finish_job(ctx, logger, &reporter, &job.upload_id).await?,
        }
    } else {
        // Redelivery of a job whose OCR already finished.
        finish_job(ctx, logger, &reporter, &job.upload_id).await?;
    }

    Ok(())
}

/// Run one `OcrBatch` job: OCR its pending scenes and chain the next
/// step. The last batch assembles the report and completes the upload.
pub async fn process_ocr_batch(ctx: &ProcessingContext, job: &OcrBatchJob) -> WorkerResult<()> {
    let logger = JobLogger::new(&job.upload_id, "ocr_batch");
    let dir = ctx.job_dir(job.upload_id.as_str());

    let result = run_batch(ctx, job, &logger, &dir)
        .instrument(logger.create_span())
        .await;

    cleanup_dir(&dir).await;
    result
}

async fn run_batch(
    ctx: &ProcessingContext,
    job: &OcrBatchJob,
    logger: &JobLogger,
    dir: &Path,
) -> WorkerResult<()> {
    let Some(checkpoint) = ctx.checkpoints.load(&job.upload_id).await? else {
        logger.log_warning("Checkpoint absent or expired, dropping batch job");
        return Ok(());
    };

    tokio::fs::create_dir_all(dir).await?;
    let reporter = ProgressReporter::new(Arc::clone(&ctx.status), job.upload_id.clone());

    let video_path = dir.join("video.mp4");
    ensure_local_video(ctx, &checkpoint, "", &video_path).await?;

    let scenes = rebuild_scenes(&checkpoint, &SceneDetectConfig::default())?;
    let frames = Arc::new(FfmpegFrameSource::new(
        ctx.runner.clone(),
        &video_path,
        dir,
        ctx.storage.clone(),
        checkpoint.user_id.clone(),
        job.upload_id.clone(),
        Arc::clone(&ctx.ffmpeg_slots),
    ));
    let chain = QueueBatchChain::new(Arc::clone(&ctx.queue));
    let config = OcrBatchConfig {
        batch_size: ctx.config.ocr_batch_size,
        frame_concurrency: ctx.config.frame_concurrency,
        max_batch_failures: ctx.config.max_batch_failures,
    };

    let outcome = run_ocr_batch(
        ctx.checkpoints.as_ref(),
        &ctx.ocr,
        frames,
        &chain,
        &scenes,
        job,
        &config,
    )
    .await?;

    match outcome {
        BatchRunOutcome::NextEnqueued(next) => {
            // OCR spans the 60-95% band of overall progress.
            let done = (job.batch_index + 1).min(job.total_batches);
            let percent = 60 + (35 * done / job.total_batches.max(1)) as u8;
            reporter
                .report(
                    percent,
                    "ocr",
                    Some(format!("batch {}/{}", done, job.total_batches)),
                )
                .await;
            logger.log_progress(&format!("Batch complete, chained batch {}", next + 1));
            Ok(())
        }
        BatchRunOutcome::Retried(failures) => {
            logger.log_warning(&format!(
                "Batch {} re-enqueued after failure {}",
                job.batch_index, failures
            ));
            Ok(())
        }
        BatchRunOutcome::FailedPermanently => {
            let message = format!(
                "OCR batch {} failed {} consecutive times, giving up",
                job.batch_index,
                job.consecutive_failures + 1
            );
            logger.log_error(&message);
            if let Err(e) = ctx.status.error(&job.upload_id, &message).await {
                warn!(upload_id = %job.upload_id, "Failed to publish job failure: {}", e);
            }
            Err(WorkerError::job_failed(message))
        }
        BatchRunOutcome::AllBatchesDone => finish_job(ctx, logger, &reporter, &job.upload_id).await,
    }
}

/// Assemble and persist the report, then complete the job: delete the
/// checkpoint (garbage-collecting the source and audio blobs) and publish
/// the terminal status.
async fn finish_job(
    ctx: &ProcessingContext,
    logger: &JobLogger,
    reporter: &ProgressReporter,
    upload_id: &UploadId,
) -> WorkerResult<()> {
    let checkpoint = ctx
        .checkpoints
        .update(
            upload_id,
            Box::new(|cp| cp.advance_to(ProcessingStep::ReportGeneration)),
        )
        .await?;
    reporter.force_report(95, "report_generation", None).await;

    let scenes = rebuild_scenes(&checkpoint, &SceneDetectConfig::default())?;
    let rows = build_rows(
        &scenes,
        &checkpoint,
        &checkpoint.transcription_segments,
        ctx.config.narration_confidence_floor,
    );
    let summary = build_summary(&rows, &checkpoint, ctx.config.narration_confidence_floor);
    let report_key = ctx
        .report
        .write(&checkpoint.user_id, upload_id, &rows, &summary)
        .await?;

    ctx.checkpoints.delete(upload_id).await?;
    if let Err(e) = ctx.status.done(upload_id).await {
        warn!(upload_id = %upload_id, "Failed to publish completion: {}", e);
    }

    logger.log_completion(&format!(
        "Report written to {} ({} scenes, {} with text)",
        report_key, summary.total_scenes, summary.scenes_with_text
    ));
    Ok(())
}

/// Make sure the job's video exists locally, downloading it from the
/// checkpointed key (or the job's source key) when missing.
async fn ensure_local_video(
    ctx: &ProcessingContext,
    checkpoint: &ProcessingCheckpoint,
    fallback_key: &str,
    video_path: &Path,
) -> WorkerResult<()> {
    if tokio::fs::try_exists(video_path).await.unwrap_or(false) {
        return Ok(());
    }
    let key = checkpoint
        .video_key
        .as_deref()
        .unwrap_or(fallback_key);
    if key.is_empty() {
        return Err(WorkerError::job_failed("No video key to restore from"));
    }
    download_large_object(&ctx.storage, key, video_path, &DownloadConfig::default()).await?;
    Ok(())
}

/// Make sure the extracted audio exists locally for resumed transcription.
async fn ensure_local_audio(
    ctx: &ProcessingContext,
    checkpoint: &ProcessingCheckpoint,
    audio_path: &Path,
) -> WorkerResult<()> {
    if tokio::fs::try_exists(audio_path).await.unwrap_or(false) {
        return Ok(());
    }
    let key = checkpoint
        .audio_key
        .as_deref()
        .ok_or_else(|| WorkerError::job_failed("Checkpoint has no audio key"))?;
    ctx.storage.download_file(key, audio_path).await?;
    Ok(())
}

async fn cleanup_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), "Failed to remove scratch directory: {}", e);
        }
    }
}
