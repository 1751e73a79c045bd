//! Scene-cut detection.
//!
//! Runs one ffmpeg scene-score pass per sensitivity threshold, on the full
//! frame and optionally on cropped sub-regions (which catch localized
//! subtitle/text changes a full-frame pass misses). Candidate cuts from all
//! passes are merged in two sequential filters:
//!
//! 1. Merge: cuts at the same instant take the maximum confidence and the
//!    union of source tags; cuts closer than the merge epsilon collapse to
//!    the higher-confidence cut (ties favor the earlier one).
//! 2. Minimum scene interval: a second, coarser proximity filter over the
//!    merged list suppresses rapid false detections such as fade-in
//!    flicker. The two thresholds are deliberately separate passes.
//!
//! Surviving cuts plus the video's end define candidate scenes. Scenes
//! shorter than the minimum duration are dropped without consuming a scene
//! number, so published numbering stays contiguous 1..K.

use std::path::Path;

use tracing::{debug, info, warn};

use vdoc_models::{Cut, CutSource, Scene};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::MediaResult;

/// Cuts closer than this are "the same instant" (one frame at 24fps is
/// ~42ms; half of that separates distinct frames from jitter).
const SAME_INSTANT_EPSILON: f64 = 0.021;

/// A cropped sub-region to run a detection pass on, as fractions of the
/// frame.
#[derive(Debug, Clone)]
pub struct CropRegion {
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl CropRegion {
    /// Bottom band of the frame where subtitles usually live.
    pub fn subtitle_band() -> Self {
        Self {
            name: "subtitle_band".to_string(),
            x: 0.0,
            y: 0.75,
            width: 1.0,
            height: 0.25,
        }
    }

    fn filter(&self) -> String {
        format!(
            "crop=iw*{}:ih*{}:iw*{}:ih*{}",
            self.width, self.height, self.x, self.y
        )
    }
}

/// Scene detection configuration.
#[derive(Debug, Clone)]
pub struct SceneDetectConfig {
    /// Sensitivity thresholds; one full-frame pass runs per threshold.
    pub thresholds: Vec<f32>,
    /// Sub-regions; each is scanned at each threshold as well.
    pub regions: Vec<CropRegion>,
    /// First-pass collapse distance in seconds.
    pub merge_epsilon_secs: f64,
    /// Second-pass minimum distance between surviving cuts.
    pub min_scene_interval_secs: f64,
    /// Scenes shorter than this are dropped (without a scene number).
    pub min_scene_duration_secs: f64,
    /// Fractional position of the sampling instant within a scene. Late
    /// enough that fade-ins have settled, not so late the next cut bleeds.
    pub sample_ratio: f64,
}

impl Default for SceneDetectConfig {
    fn default() -> Self {
        Self {
            thresholds: vec![0.4, 0.25],
            regions: vec![CropRegion::subtitle_band()],
            merge_epsilon_secs: 0.1,
            min_scene_interval_secs: 0.5,
            min_scene_duration_secs: 1.0,
            sample_ratio: 0.35,
        }
    }
}

/// Output of scene detection.
#[derive(Debug, Clone)]
pub struct SceneDetection {
    /// Cuts surviving both proximity filters.
    pub cuts: Vec<Cut>,
    /// Published scenes, numbered 1..K.
    pub scenes: Vec<Scene>,
}

/// Detect scenes in a video file.
pub async fn detect_scenes(
    runner: &FfmpegRunner,
    video: impl AsRef<Path>,
    duration_secs: f64,
    config: &SceneDetectConfig,
) -> MediaResult<SceneDetection> {
    let video = video.as_ref();
    let mut all_cuts = Vec::new();

    for &threshold in &config.thresholds {
        let source = CutSource::FullFrame { threshold };
        let cuts = run_pass(runner, video, threshold, None, source).await?;
        all_cuts.extend(cuts);

        for region in &config.regions {
            let source = CutSource::Region {
                name: region.name.clone(),
                threshold,
            };
            // A failed supplementary region pass degrades to full-frame-only
            // cuts instead of failing detection.
            match run_pass(runner, video, threshold, Some(region), source).await {
                Ok(cuts) => all_cuts.extend(cuts),
                Err(e) => warn!(
                    region = %region.name,
                    error = %e,
                    "Region detection pass failed, continuing without it"
                ),
            }
        }
    }

    let merged = merge_cuts(all_cuts, config.merge_epsilon_secs);
    let cuts = enforce_min_interval(merged, config.min_scene_interval_secs);
    let scenes = build_scenes(
        &cuts,
        duration_secs,
        config.min_scene_duration_secs,
        config.sample_ratio,
    );

    info!(
        cuts = cuts.len(),
        scenes = scenes.len(),
        "Scene detection complete"
    );

    Ok(SceneDetection { cuts, scenes })
}

async fn run_pass(
    runner: &FfmpegRunner,
    video: &Path,
    threshold: f32,
    region: Option<&CropRegion>,
    source: CutSource,
) -> MediaResult<Vec<Cut>> {
    let mut filter = String::new();
    if let Some(region) = region {
        filter.push_str(&region.filter());
        filter.push(',');
    }
    filter.push_str(&format!("select='gt(scene,{})',metadata=print", threshold));

    // metadata=print emits via the log system, so the level must be info.
    let cmd = FfmpegCommand::new_null_output(video)
        .no_audio()
        .video_filter(filter)
        .log_level("info");

    let stderr = runner.run(&cmd).await?;
    let cuts = parse_scene_cuts(&stderr, &source);
    debug!(?source, cuts = cuts.len(), "Detection pass complete");
    Ok(cuts)
}

/// Parse `metadata=print` output into cuts. The filter prints a frame line
/// carrying `pts_time:` followed by a `lavfi.scene_score=` line.
pub fn parse_scene_cuts(stderr: &str, source: &CutSource) -> Vec<Cut> {
    let mut cuts = Vec::new();
    let mut pending_ts: Option<f64> = None;

    for line in stderr.lines() {
        if let Some(ts) = extract_field(line, "pts_time:") {
            pending_ts = Some(ts);
        } else if let Some(score) = extract_field(line, "lavfi.scene_score=") {
            if let Some(ts) = pending_ts.take() {
                cuts.push(Cut::new(ts, score.clamp(0.0, 1.0), source.clone()));
            }
        }
    }
    cuts
}

fn extract_field(line: &str, prefix: &str) -> Option<f64> {
    let start = line.find(prefix)? + prefix.len();
    let rest = &line[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-')
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// First proximity filter: same-instant cuts take the maximum confidence
/// and the union of sources; cuts within the merge epsilon collapse to the
/// higher-confidence cut (ties favor the earlier one).
pub fn merge_cuts(mut cuts: Vec<Cut>, merge_epsilon_secs: f64) -> Vec<Cut> {
    if cuts.is_empty() {
        return cuts;
    }

    cuts.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

    // Same-instant grouping across passes.
    let mut grouped: Vec<Cut> = Vec::with_capacity(cuts.len());
    for cut in cuts {
        match grouped.last_mut() {
            Some(last) if cut.timestamp - last.timestamp <= SAME_INSTANT_EPSILON => {
                last.confidence = last.confidence.max(cut.confidence);
                for src in cut.sources {
                    if !last.sources.contains(&src) {
                        last.sources.push(src);
                    }
                }
            }
            _ => grouped.push(cut),
        }
    }

    // Epsilon collapse, higher confidence wins, earlier on ties.
    let mut merged: Vec<Cut> = Vec::with_capacity(grouped.len());
    for cut in grouped {
        match merged.last_mut() {
            Some(last) if cut.timestamp - last.timestamp < merge_epsilon_secs => {
                if cut.confidence > last.confidence {
                    let absorbed = last.timestamp;
                    *last = cut;
                    last.merge_reason =
                        Some(format!("absorbed lower-confidence cut at {:.3}s", absorbed));
                } else {
                    last.merge_reason = Some(format!(
                        "absorbed lower-confidence cut at {:.3}s",
                        cut.timestamp
                    ));
                }
            }
            _ => merged.push(cut),
        }
    }
    merged
}

/// Second proximity filter over the merged list, with a separate (coarser)
/// threshold. Same keep rule: higher confidence wins, earlier on ties.
pub fn enforce_min_interval(cuts: Vec<Cut>, min_interval_secs: f64) -> Vec<Cut> {
    let mut kept: Vec<Cut> = Vec::with_capacity(cuts.len());
    for cut in cuts {
        match kept.last_mut() {
            Some(last) if cut.timestamp - last.timestamp < min_interval_secs => {
                if cut.confidence > last.confidence {
                    let absorbed = last.timestamp;
                    *last = cut;
                    last.merge_reason =
                        Some(format!("below min scene interval, replaced cut at {:.3}s", absorbed));
                }
            }
            _ => kept.push(cut),
        }
    }
    kept
}

/// Build published scenes from surviving cuts. The video start and end are
/// implicit boundaries. Scenes shorter than the minimum duration are
/// dropped without consuming a number. Zero cuts fall back to one scene
/// covering the whole video.
pub fn build_scenes(
    cuts: &[Cut],
    duration_secs: f64,
    min_scene_duration_secs: f64,
    sample_ratio: f64,
) -> Vec<Scene> {
    let mut boundaries: Vec<f64> = Vec::with_capacity(cuts.len() + 2);
    if cuts.first().map_or(true, |c| c.timestamp > SAME_INSTANT_EPSILON) {
        boundaries.push(0.0);
    }
    boundaries.extend(cuts.iter().map(|c| c.timestamp));
    boundaries.push(duration_secs);

    let mut scenes = Vec::new();
    let mut number = 1u32;
    for pair in boundaries.windows(2) {
        let (start, end) = (pair[0], pair[1]);
        if end - start < min_scene_duration_secs {
            continue;
        }
        scenes.push(Scene::from_bounds(number, start, end, sample_ratio));
        number += 1;
    }

    if scenes.is_empty() && duration_secs > 0.0 {
        // Nothing survived: the whole video is one scene rather than none.
        scenes.push(Scene::from_bounds(1, 0.0, duration_secs, sample_ratio));
    }

    scenes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(ts: f64, conf: f64) -> Cut {
        Cut::new(ts, conf, CutSource::FullFrame { threshold: 0.4 })
    }

    fn region(ts: f64, conf: f64) -> Cut {
        Cut::new(
            ts,
            conf,
            CutSource::Region {
                name: "subtitle_band".into(),
                threshold: 0.4,
            },
        )
    }

    #[test]
    fn test_parse_scene_cuts() {
        let stderr = "\
[Parsed_metadata_1 @ 0x1] frame:10 pts:3003 pts_time:3.003
[Parsed_metadata_1 @ 0x1] lavfi.scene_score=0.523000
[Parsed_metadata_1 @ 0x1] frame:55 pts:16516 pts_time:16.516
[Parsed_metadata_1 @ 0x1] lavfi.scene_score=0.871000
noise line without fields
";
        let cuts = parse_scene_cuts(stderr, &CutSource::FullFrame { threshold: 0.4 });
        assert_eq!(cuts.len(), 2);
        assert!((cuts[0].timestamp - 3.003).abs() < 1e-9);
        assert!((cuts[1].confidence - 0.871).abs() < 1e-9);
    }

    #[test]
    fn test_same_instant_takes_max_confidence_and_union_sources() {
        let merged = merge_cuts(vec![full(5.0, 0.6), region(5.0, 0.9)], 0.1);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].confidence - 0.9).abs() < 1e-9);
        assert_eq!(merged[0].sources.len(), 2);
    }

    #[test]
    fn test_epsilon_collapse_keeps_higher_confidence() {
        // Cuts at 5.0 and 5.05 with a 0.1s epsilon: only the
        // higher-confidence one survives.
        let merged = merge_cuts(vec![full(5.0, 0.4), full(5.05, 0.8)], 0.1);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].timestamp - 5.05).abs() < 1e-9);
        assert!(merged[0].merge_reason.is_some());
    }

    #[test]
    fn test_epsilon_collapse_tie_favors_earlier() {
        let merged = merge_cuts(vec![full(5.0, 0.8), full(5.05, 0.8)], 0.1);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].timestamp - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_min_interval_is_separate_second_pass() {
        // Two cuts 0.3s apart survive the 0.1s merge epsilon but not the
        // 0.5s minimum scene interval.
        let merged = merge_cuts(vec![full(5.0, 0.9), full(5.3, 0.4)], 0.1);
        assert_eq!(merged.len(), 2);
        let kept = enforce_min_interval(merged, 0.5);
        assert_eq!(kept.len(), 1);
        assert!((kept[0].timestamp - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_build_scenes_numbering_contiguous() {
        // Cuts at 10 and 10.5 produce a 0.5s middle scene that is dropped;
        // numbering must stay contiguous.
        let cuts = vec![full(10.0, 0.9), full(10.5, 0.9), full(20.0, 0.9)];
        let scenes = build_scenes(&cuts, 30.0, 1.0, 0.35);
        let numbers: Vec<u32> = scenes.iter().map(|s| s.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(scenes.len(), 3);
        assert!((scenes[1].start - 10.5).abs() < 1e-9);
    }

    #[test]
    fn test_build_scenes_zero_cuts_fallback() {
        let scenes = build_scenes(&[], 120.0, 1.0, 0.35);
        assert_eq!(scenes.len(), 1);
        assert_eq!(scenes[0].number, 1);
        assert!((scenes[0].end - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_build_scenes_sampling_ratio() {
        let scenes = build_scenes(&[full(10.0, 0.9)], 20.0, 1.0, 0.25);
        // Second scene [10, 20), sample at 12.5.
        assert!((scenes[1].sample_at - 12.5).abs() < 1e-9);
    }

    #[test]
    fn test_crop_region_filter() {
        let filter = CropRegion::subtitle_band().filter();
        assert_eq!(filter, "crop=iw*1:ih*0.25:iw*0:ih*0.75");
    }
}
