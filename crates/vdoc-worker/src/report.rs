//! Report assembly.
//!
//! Joins the scene list, OCR results, and transcription segments into one
//! row per published scene plus an aggregate summary, then hands both to a
//! sink. The production sink writes JSON lines to object storage for the
//! spreadsheet renderer to pick up.

use async_trait::async_trait;
use tracing::info;
use vdoc_models::{
    ProcessingCheckpoint, ReportRow, ReportSummary, Scene, Segment, UploadId, NO_TEXT_MARKER,
};
use vdoc_storage::ObjectStoreClient;

use crate::error::WorkerResult;
use crate::ocr_batches::scene_screenshot_key;

/// Receives the finished report. Returns the blob key it was written to.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn write(
        &self,
        user_id: &str,
        upload_id: &UploadId,
        rows: &[ReportRow],
        summary: &ReportSummary,
    ) -> WorkerResult<String>;
}

/// Writes the report as JSON lines to object storage: one object per row,
/// then the summary object.
pub struct JsonLinesReportSink {
    storage: ObjectStoreClient,
}

impl JsonLinesReportSink {
    pub fn new(storage: ObjectStoreClient) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl ReportSink for JsonLinesReportSink {
    async fn write(
        &self,
        user_id: &str,
        upload_id: &UploadId,
        rows: &[ReportRow],
        summary: &ReportSummary,
    ) -> WorkerResult<String> {
        let mut body = String::new();
        for row in rows {
            body.push_str(&serde_json::to_string(row)?);
            body.push('\n');
        }
        body.push_str(&serde_json::to_string(summary)?);
        body.push('\n');

        let key = format!("users/{}/uploads/{}/report.jsonl", user_id, upload_id);
        self.storage
            .upload_bytes(body.into_bytes(), &key, "application/x-ndjson")
            .await?;

        info!(upload_id = %upload_id, rows = rows.len(), key = %key, "Report written");
        Ok(key)
    }
}

/// Build one row per published scene from the checkpoint's accumulated
/// results.
///
/// OCR text that is missing or whitespace-only renders as the no-text
/// marker. Narration is every transcription segment overlapping the
/// scene's `[start, end)` window with confidence at or above the floor,
/// joined in time order.
pub fn build_rows(
    scenes: &[Scene],
    checkpoint: &ProcessingCheckpoint,
    segments: &[Segment],
    confidence_floor: f64,
) -> Vec<ReportRow> {
    scenes
        .iter()
        .map(|scene| {
            let ocr_text = checkpoint
                .ocr_results
                .get(&scene.index())
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .unwrap_or(NO_TEXT_MARKER)
                .to_string();

            let screenshot_key = checkpoint
                .completed_ocr_scenes
                .contains(&scene.index())
                .then(|| {
                    scene_screenshot_key(&checkpoint.user_id, &checkpoint.upload_id, scene.number)
                });

            let narration = segments
                .iter()
                .filter(|s| s.confidence >= confidence_floor)
                .filter(|s| s.overlaps(scene.start, scene.end))
                .map(|s| s.text.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ");

            ReportRow {
                scene_number: scene.number,
                timecode: scene.timecode.clone(),
                screenshot_key,
                ocr_text,
                narration,
            }
        })
        .collect()
}

/// Aggregate the summary sheet from the rows and the checkpoint's
/// transcription statistics. A checkpoint that never ran VAD (no ASR
/// configured) reads as all-voiced with zero savings.
pub fn build_summary(
    rows: &[ReportRow],
    checkpoint: &ProcessingCheckpoint,
    confidence_floor: f64,
) -> ReportSummary {
    ReportSummary {
        total_scenes: rows.len() as u32,
        scenes_with_text: rows.iter().filter(|r| r.ocr_text != NO_TEXT_MARKER).count() as u32,
        narration_segments: checkpoint
            .transcription_segments
            .iter()
            .filter(|s| s.confidence >= confidence_floor)
            .count() as u32,
        voice_ratio: checkpoint.voice_ratio.unwrap_or(1.0),
        estimated_savings_secs: checkpoint.estimated_savings_secs.unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn checkpoint() -> ProcessingCheckpoint {
        let mut cp = ProcessingCheckpoint::new(UploadId::from_string("u1"), "user-1", Duration::days(7));
        cp.total_scenes = Some(3);
        cp
    }

    fn scenes() -> Vec<Scene> {
        vec![
            Scene::from_bounds(1, 0.0, 10.0, 0.35),
            Scene::from_bounds(2, 10.0, 20.0, 0.35),
            Scene::from_bounds(3, 20.0, 30.0, 0.35),
        ]
    }

    fn segment(start: f64, text: &str, confidence: f64) -> Segment {
        Segment {
            start,
            duration: 2.0,
            text: text.to_string(),
            confidence,
            chunk_index: 0,
        }
    }

    #[test]
    fn test_rows_use_marker_for_missing_or_blank_ocr() {
        let mut cp = checkpoint();
        cp.merge_ocr_results([(0, "Hello".to_string()), (1, "   ".to_string())]);

        let rows = build_rows(&scenes(), &cp, &[], 0.5);
        assert_eq!(rows[0].ocr_text, "Hello");
        assert_eq!(rows[1].ocr_text, NO_TEXT_MARKER);
        assert_eq!(rows[2].ocr_text, NO_TEXT_MARKER);
    }

    #[test]
    fn test_screenshot_key_only_for_completed_scenes() {
        let mut cp = checkpoint();
        cp.merge_ocr_results([(0, "x".to_string())]);

        let rows = build_rows(&scenes(), &cp, &[], 0.5);
        assert!(rows[0].screenshot_key.as_deref().is_some_and(|k| k.contains("scene-0001")));
        assert!(rows[2].screenshot_key.is_none());
    }

    #[test]
    fn test_narration_respects_window_and_floor() {
        let cp = checkpoint();
        let segments = vec![
            segment(1.0, "first scene speech", 0.9),
            segment(9.5, "straddles the boundary", 0.9),
            segment(12.0, "low confidence", 0.2),
            segment(25.0, "third scene speech", 0.8),
        ];

        let rows = build_rows(&scenes(), &cp, &segments, 0.5);
        assert_eq!(rows[0].narration, "first scene speech straddles the boundary");
        // The straddling segment overlaps scene 2 as well; the low
        // confidence one is filtered.
        assert_eq!(rows[1].narration, "straddles the boundary");
        assert_eq!(rows[2].narration, "third scene speech");
    }

    #[test]
    fn test_summary_counts() {
        let mut cp = checkpoint();
        cp.merge_ocr_results([(0, "text".to_string()), (1, String::new())]);
        cp.merge_transcription_progress(
            [0],
            vec![
                segment(1.0, "a", 0.9),
                segment(5.0, "b", 0.3),
                segment(12.0, "c", 0.7),
            ],
        );
        cp.voice_ratio = Some(0.42);
        cp.estimated_savings_secs = Some(33.0);

        let rows = build_rows(&scenes(), &cp, &cp.transcription_segments, 0.5);
        let summary = build_summary(&rows, &cp, 0.5);
        assert_eq!(summary.total_scenes, 3);
        assert_eq!(summary.scenes_with_text, 1);
        assert_eq!(summary.narration_segments, 2);
        assert!((summary.voice_ratio - 0.42).abs() < 1e-9);
        assert!((summary.estimated_savings_secs - 33.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_without_vad_stats_defaults() {
        let cp = checkpoint();
        let summary = build_summary(&[], &cp, 0.5);
        assert!((summary.voice_ratio - 1.0).abs() < 1e-9);
        assert_eq!(summary.estimated_savings_secs, 0.0);
    }
}
