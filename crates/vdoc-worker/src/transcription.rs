//! VAD-gated transcription pipeline.
//!
//! Transcribes the planned voiced chunks in parallel through the ASR
//! gateway, shifting each chunk's segment timestamps to absolute track
//! time, and persists progress to the checkpoint every few chunks so a
//! relaunch only redoes the un-flushed tail.
//!
//! Per-chunk failure policy: a chunk whose audio cannot be read or whose
//! provider call fails terminally contributes zero segments and the
//! pipeline carries on. Downstream, a chunk with no segments reads as
//! silence, which is an accepted approximation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use vdoc_checkpoint::CheckpointStore;
use vdoc_media::voiced::VoicedAnalysis;
use vdoc_media::{FfmpegRunner, TranscriptChunk};
use vdoc_models::{Segment, UploadId};
use vdoc_providers::CapabilityGateway;

use crate::error::{WorkerError, WorkerResult};

/// Final transcription statistics surfaced in the report summary.
#[derive(Debug, Clone)]
pub struct TranscriptionOutcome {
    /// All segments, sorted by absolute start time.
    pub segments: Vec<Segment>,
    /// Voiced/total ratio; 1.0 when the fixed-interval fallback ran.
    pub voice_ratio: f64,
    /// Seconds of audio VAD gating kept away from the provider; zero
    /// under the fallback.
    pub estimated_savings_secs: f64,
    /// Whether the no-voice fallback was used.
    pub used_fallback: bool,
}

/// Yields the audio bytes for one planned chunk.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn chunk_bytes(&self, chunk: &TranscriptChunk) -> WorkerResult<Vec<u8>>;
}

/// Extracts chunks from the job's local audio file via ffmpeg.
pub struct FfmpegChunkSource {
    runner: FfmpegRunner,
    audio_path: std::path::PathBuf,
    scratch_dir: std::path::PathBuf,
    /// Worker-wide cap on concurrent ffmpeg subprocesses.
    ffmpeg_slots: Arc<Semaphore>,
}

impl FfmpegChunkSource {
    pub fn new(
        runner: FfmpegRunner,
        audio_path: impl Into<std::path::PathBuf>,
        scratch_dir: impl Into<std::path::PathBuf>,
        ffmpeg_slots: Arc<Semaphore>,
    ) -> Self {
        Self {
            runner,
            audio_path: audio_path.into(),
            scratch_dir: scratch_dir.into(),
            ffmpeg_slots,
        }
    }
}

#[async_trait]
impl ChunkSource for FfmpegChunkSource {
    async fn chunk_bytes(&self, chunk: &TranscriptChunk) -> WorkerResult<Vec<u8>> {
        let _slot = self
            .ffmpeg_slots
            .acquire()
            .await
            .map_err(|_| WorkerError::job_failed("Worker shutting down"))?;
        let out = self.scratch_dir.join(format!("chunk-{:05}.wav", chunk.index));
        vdoc_media::audio::extract_audio_chunk(
            &self.runner,
            &self.audio_path,
            chunk.start_secs(),
            chunk.duration_secs(),
            &out,
        )
        .await?;
        let bytes = tokio::fs::read(&out).await?;
        tokio::fs::remove_file(&out).await.ok();
        Ok(bytes)
    }
}

/// Tuning for the chunk loop.
#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    /// Chunks in flight at once.
    pub concurrency: usize,
    /// Persist progress every this many completed chunks.
    pub checkpoint_interval: usize,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            checkpoint_interval: 5,
        }
    }
}

/// Transcribe every not-yet-checkpointed chunk and merge the results into
/// the checkpoint. Returns the full accumulated transcript.
pub async fn transcribe_chunks(
    checkpoints: &dyn CheckpointStore,
    gateway: Arc<CapabilityGateway>,
    source: Arc<dyn ChunkSource>,
    upload_id: &UploadId,
    analysis: &VoicedAnalysis,
    config: &TranscriptionConfig,
) -> WorkerResult<TranscriptionOutcome> {
    let checkpoint = checkpoints
        .load(upload_id)
        .await?
        .ok_or_else(|| WorkerError::job_failed("Checkpoint vanished during transcription"))?;

    let pending: Vec<TranscriptChunk> = analysis
        .chunks
        .iter()
        .filter(|c| !checkpoint.completed_audio_chunks.contains(&c.index))
        .copied()
        .collect();

    info!(
        upload_id = %upload_id,
        total = analysis.chunks.len(),
        cached = analysis.chunks.len() - pending.len(),
        pending = pending.len(),
        fallback = analysis.used_fallback,
        "Transcribing chunks"
    );

    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut tasks: JoinSet<(u32, Vec<Segment>)> = JoinSet::new();

    for chunk in pending {
        let gateway = Arc::clone(&gateway);
        let source = Arc::clone(&source);
        let semaphore = Arc::clone(&semaphore);

        tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (chunk.index, Vec::new()),
            };
            (chunk.index, transcribe_one(&gateway, source.as_ref(), &chunk).await)
        });
    }

    // Flush completed chunks to the checkpoint every interval so a crash
    // loses at most one interval's work.
    let mut buffered: Vec<(u32, Vec<Segment>)> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(done) => buffered.push(done),
            Err(e) => {
                warn!("Chunk task panicked: {}", e);
                continue;
            }
        }
        if buffered.len() >= config.checkpoint_interval.max(1) {
            flush_progress(checkpoints, upload_id, std::mem::take(&mut buffered)).await?;
        }
    }
    if !buffered.is_empty() {
        flush_progress(checkpoints, upload_id, buffered).await?;
    }

    let final_checkpoint = checkpoints
        .load(upload_id)
        .await?
        .ok_or_else(|| WorkerError::job_failed("Checkpoint vanished during transcription"))?;

    Ok(TranscriptionOutcome {
        segments: final_checkpoint.transcription_segments,
        voice_ratio: analysis.voice_ratio(),
        estimated_savings_secs: analysis.estimated_savings_secs(),
        used_fallback: analysis.used_fallback,
    })
}

/// Transcribe one chunk, shifting segment timestamps to absolute time.
/// Failures resolve to an empty segment list.
async fn transcribe_one(
    gateway: &CapabilityGateway,
    source: &dyn ChunkSource,
    chunk: &TranscriptChunk,
) -> Vec<Segment> {
    let bytes = match source.chunk_bytes(chunk).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(chunk = chunk.index, "Failed to read chunk audio: {}", e);
            return Vec::new();
        }
    };

    match gateway.execute(&bytes).await {
        Ok(output) => {
            let offset = chunk.start_secs();
            let segments: Vec<Segment> = output
                .segments
                .iter()
                .map(|raw| Segment {
                    start: raw.start + offset,
                    duration: (raw.end - raw.start).max(0.0),
                    text: raw.text.clone(),
                    confidence: raw.confidence,
                    chunk_index: chunk.index,
                })
                .collect();
            debug!(chunk = chunk.index, segments = segments.len(), "Chunk transcribed");
            segments
        }
        Err(e) => {
            warn!(chunk = chunk.index, "Chunk transcription failed: {}", e);
            Vec::new()
        }
    }
}

async fn flush_progress(
    checkpoints: &dyn CheckpointStore,
    upload_id: &UploadId,
    completed: Vec<(u32, Vec<Segment>)>,
) -> WorkerResult<()> {
    let chunks: Vec<u32> = completed.iter().map(|(i, _)| *i).collect();
    let segments: Vec<Segment> = completed.into_iter().flat_map(|(_, s)| s).collect();

    debug!(chunks = chunks.len(), "Flushing transcription progress");
    checkpoints
        .update(
            upload_id,
            Box::new(move |cp| cp.merge_transcription_progress(chunks, segments)),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vdoc_checkpoint::{CheckpointStore, MemoryCheckpointStore, SaveOptions};
    use vdoc_media::voiced::VoicedAnalysis;
    use vdoc_models::{CapabilityKind, CapabilityOutput, RawSegment};
    use vdoc_providers::{Capability, GatewayConfig, ProviderResult};

    struct StubAsr {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Capability for StubAsr {
        fn name(&self) -> &str {
            "stub-asr"
        }

        fn kind(&self) -> CapabilityKind {
            CapabilityKind::Transcription
        }

        async fn call(&self, input: &[u8]) -> ProviderResult<CapabilityOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // First byte of the stub payload is the chunk index.
            let chunk = input.first().copied().unwrap_or(0);
            Ok(CapabilityOutput {
                text: format!("chunk {}", chunk),
                confidence: 0.9,
                provider: String::new(),
                latency_ms: 0,
                segments: vec![RawSegment {
                    start: 0.5,
                    end: 1.5,
                    text: format!("chunk {}", chunk),
                    confidence: 0.9,
                }],
            })
        }
    }

    struct StubChunks {
        missing: Vec<u32>,
    }

    #[async_trait]
    impl ChunkSource for StubChunks {
        async fn chunk_bytes(&self, chunk: &TranscriptChunk) -> WorkerResult<Vec<u8>> {
            if self.missing.contains(&chunk.index) {
                Err(WorkerError::Media(vdoc_media::MediaError::FileNotFound(
                    std::path::PathBuf::from(format!("chunk-{}.wav", chunk.index)),
                )))
            } else {
                Ok(vec![chunk.index as u8])
            }
        }
    }

    fn analysis(chunk_count: u32) -> VoicedAnalysis {
        let chunks = (0..chunk_count)
            .map(|i| TranscriptChunk {
                index: i,
                start_ms: i as u64 * 10_000,
                end_ms: i as u64 * 10_000 + 8_000,
            })
            .collect();
        VoicedAnalysis {
            intervals: Vec::new(),
            chunks,
            voiced_ms: chunk_count as u64 * 8_000,
            total_ms: chunk_count as u64 * 10_000,
            used_fallback: false,
        }
    }

    fn gateway(asr: Arc<StubAsr>) -> Arc<CapabilityGateway> {
        Arc::new(CapabilityGateway::new(
            asr,
            GatewayConfig {
                requests_per_window: 10_000,
                window: std::time::Duration::from_secs(1),
                ..GatewayConfig::default()
            },
        ))
    }

    #[tokio::test]
    async fn test_transcribes_all_chunks_and_sorts() {
        let store = MemoryCheckpointStore::default();
        let upload = UploadId::from_string("u1");
        store.get_or_create(&upload, "user").await.unwrap();

        let asr = Arc::new(StubAsr { calls: AtomicU32::new(0) });
        let outcome = transcribe_chunks(
            &store,
            gateway(asr.clone()),
            Arc::new(StubChunks { missing: vec![] }),
            &upload,
            &analysis(4),
            &TranscriptionConfig { concurrency: 2, checkpoint_interval: 2 },
        )
        .await
        .unwrap();

        assert_eq!(asr.calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.segments.len(), 4);
        // Absolute timestamps: chunk i starts at i*10s, segment at +0.5s.
        let starts: Vec<f64> = outcome.segments.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![0.5, 10.5, 20.5, 30.5]);
    }

    #[tokio::test]
    async fn test_resumption_skips_completed_chunks() {
        let store = MemoryCheckpointStore::default();
        let upload = UploadId::from_string("u2");
        let mut cp = store.get_or_create(&upload, "user").await.unwrap();
        cp.merge_transcription_progress(
            [0, 1],
            vec![
                Segment {
                    start: 0.5,
                    duration: 1.0,
                    text: "cached 0".into(),
                    confidence: 0.9,
                    chunk_index: 0,
                },
                Segment {
                    start: 10.5,
                    duration: 1.0,
                    text: "cached 1".into(),
                    confidence: 0.9,
                    chunk_index: 1,
                },
            ],
        );
        store.save(&mut cp, SaveOptions::versioned()).await.unwrap();

        let asr = Arc::new(StubAsr { calls: AtomicU32::new(0) });
        let outcome = transcribe_chunks(
            &store,
            gateway(asr.clone()),
            Arc::new(StubChunks { missing: vec![] }),
            &upload,
            &analysis(4),
            &TranscriptionConfig::default(),
        )
        .await
        .unwrap();

        // Only chunks 2 and 3 hit the provider.
        assert_eq!(asr.calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.segments.len(), 4);
        assert_eq!(outcome.segments[0].text, "cached 0");
    }

    #[tokio::test]
    async fn test_missing_chunk_audio_degrades_to_silence() {
        let store = MemoryCheckpointStore::default();
        let upload = UploadId::from_string("u3");
        store.get_or_create(&upload, "user").await.unwrap();

        let asr = Arc::new(StubAsr { calls: AtomicU32::new(0) });
        let outcome = transcribe_chunks(
            &store,
            gateway(asr.clone()),
            Arc::new(StubChunks { missing: vec![1] }),
            &upload,
            &analysis(3),
            &TranscriptionConfig::default(),
        )
        .await
        .unwrap();

        // The missing chunk never reaches the provider and yields nothing,
        // but the other chunks complete.
        assert_eq!(asr.calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.segments.len(), 2);

        // The failed chunk is still marked completed so a resume does not
        // retry it forever.
        let cp = store.load(&upload).await.unwrap().unwrap();
        assert!(cp.completed_audio_chunks.contains(&1));
    }

    #[tokio::test]
    async fn test_fallback_stats_flow_through() {
        let store = MemoryCheckpointStore::default();
        let upload = UploadId::from_string("u4");
        store.get_or_create(&upload, "user").await.unwrap();

        let mut fallback = analysis(2);
        fallback.used_fallback = true;

        let asr = Arc::new(StubAsr { calls: AtomicU32::new(0) });
        let outcome = transcribe_chunks(
            &store,
            gateway(asr),
            Arc::new(StubChunks { missing: vec![] }),
            &upload,
            &fallback,
            &TranscriptionConfig::default(),
        )
        .await
        .unwrap();

        assert!(outcome.used_fallback);
        assert_eq!(outcome.voice_ratio, 1.0);
        assert_eq!(outcome.estimated_savings_secs, 0.0);
        assert!(!outcome.segments.is_empty());
    }
}
