//! Processing checkpoint: the durable record of one job's progress.
//!
//! One checkpoint exists per upload. It is created when the job is first
//! touched, mutated after every step boundary and every checkpoint interval
//! of sub-progress, deleted on success, and swept (with its blob artifacts)
//! once past its expiry.
//!
//! Invariants:
//! - `completed_audio_chunks` and `transcription_segments` only ever grow
//!   until the job completes or expires.
//! - `ocr_results` keys are scene indices in `[0, total_scenes)`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::job::UploadId;
use crate::scene::Cut;
use crate::step::ProcessingStep;

/// One transcribed unit of speech. Immutable once appended to a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Absolute start offset in seconds from the beginning of the video.
    pub start: f64,
    /// Duration in seconds.
    pub duration: f64,
    /// Transcribed text.
    pub text: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Index of the audio chunk this segment came from.
    pub chunk_index: u32,
}

impl Segment {
    /// End offset in seconds.
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Whether this segment overlaps the half-open window `[start, end)`.
    pub fn overlaps(&self, start: f64, end: f64) -> bool {
        self.start < end && self.end() > start
    }
}

/// Durable record of a job's progress through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingCheckpoint {
    /// Upload this checkpoint belongs to (primary key).
    pub upload_id: UploadId,
    /// Owning user.
    pub user_id: String,
    /// Step currently being worked on. Everything before it is complete.
    pub current_step: ProcessingStep,
    /// Blob key of the downloaded video, once the download step completed.
    pub video_key: Option<String>,
    /// Blob key of the extracted audio track.
    pub audio_key: Option<String>,
    /// Video duration in seconds, known after probing.
    pub video_duration: Option<f64>,
    /// Total audio chunks expected by the transcription pipeline.
    pub total_audio_chunks: Option<u32>,
    /// Total scenes detected.
    pub total_scenes: Option<u32>,
    /// Voiced/total audio ratio from VAD analysis, once transcription ran.
    #[serde(default)]
    pub voice_ratio: Option<f64>,
    /// Seconds of audio VAD gating kept away from the ASR provider.
    #[serde(default)]
    pub estimated_savings_secs: Option<f64>,
    /// Chunk indices whose transcription has been persisted.
    pub completed_audio_chunks: BTreeSet<u32>,
    /// Accumulated transcription segments, sorted by start time.
    pub transcription_segments: Vec<Segment>,
    /// Detected scene cuts, serialized once scene detection completes.
    pub scene_cuts: Vec<Cut>,
    /// Scene indices whose OCR result has been persisted.
    pub completed_ocr_scenes: BTreeSet<u32>,
    /// OCR text keyed by scene index.
    pub ocr_results: BTreeMap<u32, String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last save timestamp. Stamped on every save.
    pub updated_at: DateTime<Utc>,
    /// Expiry timestamp. Past this, the checkpoint is treated as absent
    /// and eventually swept together with its blob artifacts.
    pub expires_at: DateTime<Utc>,
    /// Optimistic-concurrency counter, bumped on every save.
    pub version: u64,
    /// Number of times the job was relaunched after an interruption.
    pub retry_count: u32,
}

impl ProcessingCheckpoint {
    /// Create a fresh checkpoint at the first pipeline step.
    pub fn new(upload_id: UploadId, user_id: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            upload_id,
            user_id: user_id.into(),
            current_step: ProcessingStep::Downloading,
            video_key: None,
            audio_key: None,
            video_duration: None,
            total_audio_chunks: None,
            total_scenes: None,
            voice_ratio: None,
            estimated_savings_secs: None,
            completed_audio_chunks: BTreeSet::new(),
            transcription_segments: Vec::new(),
            scene_cuts: Vec::new(),
            completed_ocr_scenes: BTreeSet::new(),
            ocr_results: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            version: 0,
            retry_count: 0,
        }
    }

    /// Whether this checkpoint is past its expiry at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether this checkpoint is past its expiry right now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Advance to a later step. Backward transitions are ignored: the step
    /// machine only moves forward.
    pub fn advance_to(&mut self, step: ProcessingStep) {
        if step.index() > self.current_step.index() {
            self.current_step = step;
        }
    }

    /// Merge newly completed chunks and their segments into the checkpoint.
    ///
    /// Progress is monotonic: already-recorded chunks are ignored so a
    /// replayed delivery cannot duplicate segments. The accumulated segment
    /// list is re-sorted by absolute start time after merging.
    pub fn merge_transcription_progress(
        &mut self,
        chunks: impl IntoIterator<Item = u32>,
        segments: impl IntoIterator<Item = Segment>,
    ) {
        let mut fresh: BTreeSet<u32> = BTreeSet::new();
        for chunk in chunks {
            if self.completed_audio_chunks.insert(chunk) {
                fresh.insert(chunk);
            }
        }

        self.transcription_segments
            .extend(segments.into_iter().filter(|s| fresh.contains(&s.chunk_index)));
        self.transcription_segments
            .sort_by(|a, b| a.start.total_cmp(&b.start));
    }

    /// Merge newly obtained OCR results. Scene indices outside
    /// `[0, total_scenes)` are dropped; existing entries are kept as-is.
    pub fn merge_ocr_results(&mut self, results: impl IntoIterator<Item = (u32, String)>) {
        let limit = self.total_scenes.unwrap_or(u32::MAX);
        for (scene, text) in results {
            if scene >= limit {
                continue;
            }
            self.completed_ocr_scenes.insert(scene);
            self.ocr_results.entry(scene).or_insert(text);
        }
    }

    /// Blob keys of intermediate artifacts referenced by this checkpoint,
    /// for garbage collection on delete/sweep.
    pub fn artifact_keys(&self) -> Vec<String> {
        self.video_key
            .iter()
            .chain(self.audio_key.iter())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint() -> ProcessingCheckpoint {
        ProcessingCheckpoint::new(UploadId::from_string("u1"), "user-1", Duration::days(7))
    }

    fn segment(chunk: u32, start: f64) -> Segment {
        Segment {
            start,
            duration: 1.0,
            text: format!("chunk {}", chunk),
            confidence: 0.9,
            chunk_index: chunk,
        }
    }

    #[test]
    fn test_fresh_checkpoint_starts_at_download() {
        let cp = checkpoint();
        assert_eq!(cp.current_step, ProcessingStep::Downloading);
        assert_eq!(cp.version, 0);
        assert!(!cp.is_expired());
    }

    #[test]
    fn test_advance_never_moves_backward() {
        let mut cp = checkpoint();
        cp.advance_to(ProcessingStep::Ocr);
        cp.advance_to(ProcessingStep::Transcription);
        assert_eq!(cp.current_step, ProcessingStep::Ocr);
    }

    #[test]
    fn test_transcription_merge_is_monotonic() {
        let mut cp = checkpoint();
        cp.merge_transcription_progress([0, 1], vec![segment(0, 5.0), segment(1, 2.0)]);
        assert_eq!(cp.completed_audio_chunks.len(), 2);
        assert_eq!(cp.transcription_segments.len(), 2);

        // Replaying chunk 1 must not duplicate its segments.
        cp.merge_transcription_progress([1, 2], vec![segment(1, 2.0), segment(2, 9.0)]);
        assert_eq!(cp.completed_audio_chunks.len(), 3);
        assert_eq!(cp.transcription_segments.len(), 3);
    }

    #[test]
    fn test_segments_sorted_after_merge() {
        let mut cp = checkpoint();
        cp.merge_transcription_progress([0, 1, 2], vec![
            segment(0, 9.0),
            segment(1, 1.0),
            segment(2, 4.0),
        ]);
        let starts: Vec<f64> = cp.transcription_segments.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![1.0, 4.0, 9.0]);
    }

    #[test]
    fn test_ocr_merge_respects_scene_bounds() {
        let mut cp = checkpoint();
        cp.total_scenes = Some(3);
        cp.merge_ocr_results([(0, "a".into()), (2, "b".into()), (5, "out".into())]);
        assert_eq!(cp.ocr_results.len(), 2);
        assert!(!cp.ocr_results.contains_key(&5));
    }

    #[test]
    fn test_expiry() {
        let mut cp = checkpoint();
        cp.expires_at = Utc::now() - Duration::seconds(1);
        assert!(cp.is_expired());
    }

    #[test]
    fn test_segment_overlap() {
        let s = segment(0, 10.0);
        assert!(s.overlaps(10.5, 12.0));
        assert!(s.overlaps(9.0, 10.5));
        assert!(!s.overlaps(11.0, 12.0));
        assert!(!s.overlaps(8.0, 10.0));
    }

    #[test]
    fn test_artifact_keys() {
        let mut cp = checkpoint();
        assert!(cp.artifact_keys().is_empty());
        cp.video_key = Some("uploads/u1/video.mp4".into());
        cp.audio_key = Some("uploads/u1/audio.wav".into());
        assert_eq!(cp.artifact_keys().len(), 2);
    }
}
