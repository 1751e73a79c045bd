//! Scene cuts, scenes, and OCR batch partitioning.

use serde::{Deserialize, Serialize};

use crate::timecode::format_timecode;

/// Which detection pass produced a cut.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CutSource {
    /// Full-frame differencing pass at the given sensitivity threshold.
    FullFrame { threshold: f32 },
    /// Cropped sub-region pass (catches localized subtitle/text changes).
    Region { name: String, threshold: f32 },
}

/// A single detected instant of visual change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cut {
    /// Timestamp in seconds.
    pub timestamp: f64,
    /// Detection confidence in `[0, 1]`.
    pub confidence: f64,
    /// Passes that detected this cut. Grows when cuts from different
    /// passes are merged at the same instant.
    #[serde(default)]
    pub sources: Vec<CutSource>,
    /// Human-readable note set by the merge step (e.g. which nearby cut
    /// this one absorbed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_reason: Option<String>,
}

impl Cut {
    pub fn new(timestamp: f64, confidence: f64, source: CutSource) -> Self {
        Self {
            timestamp,
            confidence,
            sources: vec![source],
            merge_reason: None,
        }
    }
}

/// A contiguous time range of video bounded by two cuts (or a cut and the
/// video's end), sampled once for OCR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    /// 1-based scene number. Contiguous across published scenes: dropped
    /// sub-minimum scenes do not consume a number.
    pub number: u32,
    /// Start time in seconds (inclusive).
    pub start: f64,
    /// End time in seconds (exclusive).
    pub end: f64,
    /// Instant at which the representative frame is grabbed. Sits at a
    /// configurable fraction between start and end so that transient
    /// animations have settled.
    pub sample_at: f64,
    /// Human timecode of the scene start.
    pub timecode: String,
    /// Blob key of the extracted screenshot, once available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_key: Option<String>,
}

impl Scene {
    /// Build a scene from its boundaries, placing the sampling instant at
    /// `sample_ratio` of the way from start to end.
    pub fn from_bounds(number: u32, start: f64, end: f64, sample_ratio: f64) -> Self {
        let ratio = sample_ratio.clamp(0.0, 1.0);
        Self {
            number,
            start,
            end,
            sample_at: start + (end - start) * ratio,
            timecode: format_timecode(start),
            screenshot_key: None,
        }
    }

    /// Scene duration in seconds.
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Zero-based index of this scene (`number` is 1-based).
    pub fn index(&self) -> u32 {
        self.number.saturating_sub(1)
    }
}

/// A contiguous slice of scene indices processed and checkpointed as one
/// unit: either every scene in it gets an OCR result or the batch is retried
/// as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneBatch {
    /// 0-based batch index.
    pub index: u32,
    /// First scene index (inclusive).
    pub start: u32,
    /// Last scene index (exclusive).
    pub end: u32,
}

impl SceneBatch {
    /// Scene indices covered by this batch.
    pub fn scene_indices(&self) -> impl Iterator<Item = u32> {
        self.start..self.end
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Partition `total_scenes` into batches of at most `batch_size`.
pub fn batch_ranges(total_scenes: u32, batch_size: u32) -> Vec<SceneBatch> {
    if total_scenes == 0 || batch_size == 0 {
        return Vec::new();
    }

    let total_batches = total_scenes.div_ceil(batch_size);
    (0..total_batches)
        .map(|index| SceneBatch {
            index,
            start: index * batch_size,
            end: ((index + 1) * batch_size).min(total_scenes),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_sampling_instant() {
        let scene = Scene::from_bounds(1, 10.0, 20.0, 0.3);
        assert!((scene.sample_at - 13.0).abs() < 1e-9);
        assert_eq!(scene.timecode, "00:00:10");
    }

    #[test]
    fn test_scene_sampling_ratio_clamped() {
        let scene = Scene::from_bounds(1, 0.0, 10.0, 1.5);
        assert!((scene.sample_at - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_batch_ranges_exact_division() {
        let batches = batch_ranges(40, 10);
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[0].start, 0);
        assert_eq!(batches[0].end, 10);
        assert_eq!(batches[3].start, 30);
        assert_eq!(batches[3].end, 40);
    }

    #[test]
    fn test_batch_ranges_remainder() {
        let batches = batch_ranges(25, 10);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 5);
    }

    #[test]
    fn test_batch_ranges_empty() {
        assert!(batch_ranges(0, 10).is_empty());
        assert!(batch_ranges(10, 0).is_empty());
    }

    #[test]
    fn test_batch_indices_cover_all_scenes() {
        let batches = batch_ranges(23, 7);
        let covered: Vec<u32> = batches.iter().flat_map(|b| b.scene_indices()).collect();
        assert_eq!(covered, (0..23).collect::<Vec<_>>());
    }
}
