//! Voiced-interval detection and transcription chunk planning.
//!
//! Converts a stream of VAD speech probabilities into voiced intervals,
//! handles long files by windowing the analysis, and plans the chunk list
//! the transcription pipeline feeds to ASR providers.
//!
//! Long files are pre-split into overlapping fixed-length windows so a
//! single VAD pass never holds the whole track in memory. Each window's
//! intervals are shifted by the window offset and merged: intervals within
//! a small epsilon of each other collapse into one, keeping the union span,
//! and near-duplicate chunks from a window seam collapse with chunk indices
//! renumbered to stay contiguous.

use std::path::Path;

use tracing::{debug, info};

use crate::audio::load_samples;
use crate::command::FfmpegRunner;
use crate::error::MediaResult;
use crate::vad::SpeechDetector;

/// One voiced span of audio, in milliseconds from track start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoicedInterval {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl VoicedInterval {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    /// Shift by a window offset.
    pub fn shifted(self, offset_ms: u64) -> Self {
        Self {
            start_ms: self.start_ms + offset_ms,
            end_ms: self.end_ms + offset_ms,
        }
    }
}

/// One chunk of audio to transcribe. Indices are contiguous from zero and
/// stable for a given track, which is what per-chunk checkpointing keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscriptChunk {
    pub index: u32,
    pub start_ms: u64,
    pub end_ms: u64,
}

impl TranscriptChunk {
    pub fn start_secs(&self) -> f64 {
        self.start_ms as f64 / 1000.0
    }

    pub fn duration_secs(&self) -> f64 {
        (self.end_ms - self.start_ms) as f64 / 1000.0
    }
}

/// Configuration for voiced analysis and chunk planning.
#[derive(Debug, Clone)]
pub struct VoicedConfig {
    /// Speech probability at or above which a frame counts as voiced.
    pub vad_threshold: f32,
    /// Silence must persist this long to close a voiced interval.
    pub min_silence_ms: u64,
    /// Voiced intervals shorter than this are discarded as blips.
    pub min_voice_ms: u64,
    /// Tracks longer than this are analyzed in windows.
    pub long_file_threshold_secs: f64,
    /// Window length for long-file analysis.
    pub window_secs: f64,
    /// Overlap between adjacent windows.
    pub overlap_secs: f64,
    /// Intervals/chunks within this of each other are merged at seams.
    pub merge_epsilon_ms: u64,
    /// Chunks are split so none exceeds this length.
    pub max_chunk_secs: f64,
    /// Chunk length used by the no-voice fallback.
    pub fallback_chunk_secs: f64,
}

impl Default for VoicedConfig {
    fn default() -> Self {
        Self {
            vad_threshold: 0.5,
            min_silence_ms: 700,
            min_voice_ms: 250,
            long_file_threshold_secs: 1800.0,
            window_secs: 600.0,
            overlap_secs: 5.0,
            merge_epsilon_ms: 100,
            max_chunk_secs: 30.0,
            fallback_chunk_secs: 30.0,
        }
    }
}

/// Result of voiced analysis over one track.
#[derive(Debug, Clone)]
pub struct VoicedAnalysis {
    /// Merged voiced intervals.
    pub intervals: Vec<VoicedInterval>,
    /// Planned transcription chunks.
    pub chunks: Vec<TranscriptChunk>,
    /// Total voiced duration in milliseconds.
    pub voiced_ms: u64,
    /// Track duration in milliseconds.
    pub total_ms: u64,
    /// True when no voice was found and the fixed-interval fallback was
    /// used: the whole track is chunked and `voice_ratio` reads 1.0.
    pub used_fallback: bool,
}

impl VoicedAnalysis {
    /// Ratio of voiced to total duration. 1.0 under the fallback.
    pub fn voice_ratio(&self) -> f64 {
        if self.used_fallback {
            return 1.0;
        }
        if self.total_ms == 0 {
            return 0.0;
        }
        self.voiced_ms as f64 / self.total_ms as f64
    }

    /// Seconds of audio VAD gating avoided sending to a provider. Zero
    /// under the fallback.
    pub fn estimated_savings_secs(&self) -> f64 {
        if self.used_fallback {
            return 0.0;
        }
        (self.total_ms.saturating_sub(self.voiced_ms)) as f64 / 1000.0
    }
}

/// Analyze a 16 kHz mono audio file and plan transcription chunks.
pub async fn analyze_voiced(
    runner: &FfmpegRunner,
    audio: impl AsRef<Path>,
    total_duration_secs: f64,
    config: &VoicedConfig,
) -> MediaResult<VoicedAnalysis> {
    let audio = audio.as_ref();
    let total_ms = (total_duration_secs * 1000.0) as u64;

    let windows = plan_windows(
        total_duration_secs,
        config.long_file_threshold_secs,
        config.window_secs,
        config.overlap_secs,
    );

    let mut intervals = Vec::new();
    for window in &windows {
        let samples = load_samples(runner, audio, window.start_secs, Some(window.len_secs)).await?;
        let mut detector = SpeechDetector::new(crate::audio::AUDIO_SAMPLE_RATE as usize)?;
        let window_intervals = intervals_from_samples(&samples, &mut detector, config);
        let offset_ms = (window.start_secs * 1000.0) as u64;
        intervals.extend(window_intervals.into_iter().map(|iv| iv.shifted(offset_ms)));
    }

    let intervals = merge_intervals(intervals, config.merge_epsilon_ms);
    let voiced_ms: u64 = intervals.iter().map(|iv| iv.duration_ms()).sum();

    if intervals.is_empty() {
        // BGM-only or silent audio: transcribe the whole track in fixed
        // chunks rather than returning nothing.
        info!("No voiced intervals found, falling back to fixed chunks");
        let chunks = fallback_chunks(total_ms, (config.fallback_chunk_secs * 1000.0) as u64);
        return Ok(VoicedAnalysis {
            intervals: Vec::new(),
            chunks,
            voiced_ms: 0,
            total_ms,
            used_fallback: true,
        });
    }

    let chunks = plan_chunks(
        &intervals,
        (config.max_chunk_secs * 1000.0) as u64,
        config.merge_epsilon_ms,
    );

    debug!(
        intervals = intervals.len(),
        chunks = chunks.len(),
        voiced_ms,
        total_ms,
        "Voiced analysis complete"
    );

    Ok(VoicedAnalysis {
        intervals,
        chunks,
        voiced_ms,
        total_ms,
        used_fallback: false,
    })
}

/// One analysis window over the track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisWindow {
    pub start_secs: f64,
    pub len_secs: f64,
}

/// Split a track into analysis windows. Short tracks get a single window.
pub fn plan_windows(
    total_secs: f64,
    long_threshold_secs: f64,
    window_secs: f64,
    overlap_secs: f64,
) -> Vec<AnalysisWindow> {
    if total_secs <= long_threshold_secs || window_secs <= overlap_secs {
        return vec![AnalysisWindow {
            start_secs: 0.0,
            len_secs: total_secs,
        }];
    }

    let stride = window_secs - overlap_secs;
    let mut windows = Vec::new();
    let mut start = 0.0;
    while start < total_secs {
        let len = window_secs.min(total_secs - start);
        windows.push(AnalysisWindow {
            start_secs: start,
            len_secs: len,
        });
        start += stride;
    }
    windows
}

/// Run the VAD state machine over raw samples, producing voiced intervals
/// relative to the start of the sample buffer.
pub fn intervals_from_samples(
    samples: &[f32],
    detector: &mut SpeechDetector,
    config: &VoicedConfig,
) -> Vec<VoicedInterval> {
    let frame_size = detector.frame_size();
    let frame_ms = detector.frame_duration_ms();
    let probs = samples
        .chunks_exact(frame_size)
        .map(|frame| detector.predict(frame))
        .collect::<Vec<_>>();
    intervals_from_probs(&probs, frame_ms, config)
}

/// Pure state machine: speech probabilities to voiced intervals.
///
/// A voiced interval opens on the first frame at or above the threshold and
/// closes once silence persists for `min_silence_ms`. Intervals shorter than
/// `min_voice_ms` are dropped.
pub fn intervals_from_probs(
    probs: &[f32],
    frame_ms: u64,
    config: &VoicedConfig,
) -> Vec<VoicedInterval> {
    enum State {
        Silence,
        Voiced { start_ms: u64, silence_since: Option<u64> },
    }

    let mut state = State::Silence;
    let mut intervals = Vec::new();

    for (i, &prob) in probs.iter().enumerate() {
        let now_ms = i as u64 * frame_ms;
        let is_speech = prob >= config.vad_threshold;

        state = match (state, is_speech) {
            (State::Silence, true) => State::Voiced {
                start_ms: now_ms,
                silence_since: None,
            },
            (State::Silence, false) => State::Silence,
            (State::Voiced { start_ms, .. }, true) => State::Voiced {
                start_ms,
                silence_since: None,
            },
            (State::Voiced { start_ms, silence_since }, false) => {
                let since = silence_since.unwrap_or(now_ms);
                if now_ms.saturating_sub(since) >= config.min_silence_ms {
                    // Silence held long enough: close at where it began.
                    if since.saturating_sub(start_ms) >= config.min_voice_ms {
                        intervals.push(VoicedInterval {
                            start_ms,
                            end_ms: since,
                        });
                    }
                    State::Silence
                } else {
                    State::Voiced {
                        start_ms,
                        silence_since: Some(since),
                    }
                }
            }
        };
    }

    // Close a dangling interval at end-of-buffer.
    if let State::Voiced { start_ms, silence_since } = state {
        let end_ms = silence_since.unwrap_or(probs.len() as u64 * frame_ms);
        if end_ms.saturating_sub(start_ms) >= config.min_voice_ms {
            intervals.push(VoicedInterval { start_ms, end_ms });
        }
    }

    intervals
}

/// Merge intervals that overlap or sit within `epsilon_ms` of each other,
/// keeping the union (wider) span. Input order does not matter.
pub fn merge_intervals(mut intervals: Vec<VoicedInterval>, epsilon_ms: u64) -> Vec<VoicedInterval> {
    if intervals.is_empty() {
        return intervals;
    }

    intervals.sort_by_key(|iv| iv.start_ms);

    let mut merged: Vec<VoicedInterval> = Vec::with_capacity(intervals.len());
    for iv in intervals {
        match merged.last_mut() {
            Some(last) if iv.start_ms <= last.end_ms + epsilon_ms => {
                last.end_ms = last.end_ms.max(iv.end_ms);
            }
            _ => merged.push(iv),
        }
    }
    merged
}

/// Split merged intervals into transcription chunks no longer than
/// `max_chunk_ms`, then collapse near-duplicate chunks from window seams.
/// Chunk indices are contiguous from zero after both steps.
pub fn plan_chunks(
    intervals: &[VoicedInterval],
    max_chunk_ms: u64,
    epsilon_ms: u64,
) -> Vec<TranscriptChunk> {
    let mut chunks = Vec::new();
    for iv in intervals {
        let mut start = iv.start_ms;
        while start < iv.end_ms {
            let end = (start + max_chunk_ms).min(iv.end_ms);
            chunks.push(TranscriptChunk {
                index: 0,
                start_ms: start,
                end_ms: end,
            });
            start = end;
        }
    }
    dedup_chunks(chunks, epsilon_ms)
}

/// Collapse chunks whose boundaries both sit within `epsilon_ms` of the
/// previous chunk's, keeping the wider span, and renumber the survivors so
/// indices stay contiguous.
pub fn dedup_chunks(mut chunks: Vec<TranscriptChunk>, epsilon_ms: u64) -> Vec<TranscriptChunk> {
    chunks.sort_by_key(|c| (c.start_ms, c.end_ms));

    let mut deduped: Vec<TranscriptChunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        match deduped.last_mut() {
            Some(last)
                if chunk.start_ms.abs_diff(last.start_ms) <= epsilon_ms
                    && chunk.end_ms.abs_diff(last.end_ms) <= epsilon_ms =>
            {
                last.start_ms = last.start_ms.min(chunk.start_ms);
                last.end_ms = last.end_ms.max(chunk.end_ms);
            }
            _ => deduped.push(chunk),
        }
    }

    for (i, chunk) in deduped.iter_mut().enumerate() {
        chunk.index = i as u32;
    }
    deduped
}

/// Fixed-interval chunking of the whole track, used when VAD finds nothing.
pub fn fallback_chunks(total_ms: u64, chunk_ms: u64) -> Vec<TranscriptChunk> {
    if total_ms == 0 || chunk_ms == 0 {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start = 0u64;
    let mut index = 0u32;
    while start < total_ms {
        let end = (start + chunk_ms).min(total_ms);
        chunks.push(TranscriptChunk {
            index,
            start_ms: start,
            end_ms: end,
        });
        start = end;
        index += 1;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VoicedConfig {
        VoicedConfig {
            vad_threshold: 0.5,
            min_silence_ms: 100,
            min_voice_ms: 60,
            merge_epsilon_ms: 100,
            ..Default::default()
        }
    }

    #[test]
    fn test_probs_all_silence() {
        let probs = vec![0.1f32; 100];
        assert!(intervals_from_probs(&probs, 32, &config()).is_empty());
    }

    #[test]
    fn test_probs_speech_block() {
        // 10 silent frames, 20 voiced, 10 silent. 32ms frames.
        let mut probs = vec![0.1f32; 10];
        probs.extend(vec![0.9f32; 20]);
        probs.extend(vec![0.1f32; 10]);

        let intervals = intervals_from_probs(&probs, 32, &config());
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].start_ms, 10 * 32);
        assert_eq!(intervals[0].end_ms, 30 * 32);
    }

    #[test]
    fn test_short_blip_dropped() {
        let mut probs = vec![0.1f32; 10];
        probs.push(0.9); // single 32ms frame, below min_voice_ms
        probs.extend(vec![0.1f32; 10]);
        assert!(intervals_from_probs(&probs, 32, &config()).is_empty());
    }

    #[test]
    fn test_brief_silence_does_not_split() {
        // Voiced, 2 silent frames (64ms < 100ms hang), voiced again.
        let mut probs = vec![0.9f32; 10];
        probs.extend(vec![0.1f32; 2]);
        probs.extend(vec![0.9f32; 10]);

        let intervals = intervals_from_probs(&probs, 32, &config());
        assert_eq!(intervals.len(), 1);
    }

    #[test]
    fn test_merge_overlapping_intervals() {
        // [0, 2000] and [1950, 3000] with a 100ms epsilon merge into
        // [0, 3000].
        let merged = merge_intervals(
            vec![
                VoicedInterval { start_ms: 0, end_ms: 2000 },
                VoicedInterval { start_ms: 1950, end_ms: 3000 },
            ],
            100,
        );
        assert_eq!(merged, vec![VoicedInterval { start_ms: 0, end_ms: 3000 }]);
    }

    #[test]
    fn test_merge_within_epsilon_only() {
        let merged = merge_intervals(
            vec![
                VoicedInterval { start_ms: 0, end_ms: 1000 },
                VoicedInterval { start_ms: 1500, end_ms: 2000 },
            ],
            100,
        );
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_unsorted_input() {
        let merged = merge_intervals(
            vec![
                VoicedInterval { start_ms: 5000, end_ms: 6000 },
                VoicedInterval { start_ms: 0, end_ms: 1000 },
            ],
            100,
        );
        assert_eq!(merged[0].start_ms, 0);
        assert_eq!(merged[1].start_ms, 5000);
    }

    #[test]
    fn test_plan_chunks_splits_long_intervals() {
        let intervals = vec![VoicedInterval { start_ms: 0, end_ms: 70_000 }];
        let chunks = plan_chunks(&intervals, 30_000, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].end_ms, 30_000);
        assert_eq!(chunks[2].end_ms, 70_000);
        let indices: Vec<u32> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_dedup_chunks_collapses_seam_duplicates() {
        let chunks = vec![
            TranscriptChunk { index: 0, start_ms: 0, end_ms: 10_000 },
            TranscriptChunk { index: 1, start_ms: 30, end_ms: 10_050 },
            TranscriptChunk { index: 2, start_ms: 20_000, end_ms: 25_000 },
        ];
        let deduped = dedup_chunks(chunks, 100);
        assert_eq!(deduped.len(), 2);
        // Wider span kept.
        assert_eq!(deduped[0].start_ms, 0);
        assert_eq!(deduped[0].end_ms, 10_050);
        // Indices contiguous after merging.
        assert_eq!(deduped[0].index, 0);
        assert_eq!(deduped[1].index, 1);
    }

    #[test]
    fn test_fallback_chunks_cover_track() {
        let chunks = fallback_chunks(95_000, 30_000);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].start_ms, 90_000);
        assert_eq!(chunks[3].end_ms, 95_000);
    }

    #[test]
    fn test_plan_windows_short_track() {
        let windows = plan_windows(600.0, 1800.0, 600.0, 5.0);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start_secs, 0.0);
    }

    #[test]
    fn test_plan_windows_long_track_overlaps() {
        let windows = plan_windows(2000.0, 1800.0, 600.0, 5.0);
        assert!(windows.len() > 1);
        for pair in windows.windows(2) {
            let prev_end = pair[0].start_secs + pair[0].len_secs;
            assert!(pair[1].start_secs < prev_end, "windows must overlap");
        }
        let last = windows.last().unwrap();
        assert!((last.start_secs + last.len_secs - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn test_voice_ratio_fallback_flags() {
        let analysis = VoicedAnalysis {
            intervals: Vec::new(),
            chunks: fallback_chunks(60_000, 30_000),
            voiced_ms: 0,
            total_ms: 60_000,
            used_fallback: true,
        };
        assert_eq!(analysis.voice_ratio(), 1.0);
        assert_eq!(analysis.estimated_savings_secs(), 0.0);
        assert!(!analysis.chunks.is_empty());
    }

    #[test]
    fn test_savings_without_fallback() {
        let analysis = VoicedAnalysis {
            intervals: vec![VoicedInterval { start_ms: 0, end_ms: 15_000 }],
            chunks: Vec::new(),
            voiced_ms: 15_000,
            total_ms: 60_000,
            used_fallback: false,
        };
        assert!((analysis.voice_ratio() - 0.25).abs() < 1e-9);
        assert!((analysis.estimated_savings_secs() - 45.0).abs() < 1e-9);
    }
}
