//! Report rows handed to the spreadsheet renderer.
//!
//! The renderer itself is an external collaborator; this crate only defines
//! the structured rows it consumes.

use serde::{Deserialize, Serialize};

/// Marker used when a scene's frame yielded no OCR text.
pub const NO_TEXT_MARKER: &str = "(no text)";

/// One report row per published scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    /// 1-based scene number.
    pub scene_number: u32,
    /// Timecode of the scene start.
    pub timecode: String,
    /// Blob key of the scene screenshot, if one was extracted.
    pub screenshot_key: Option<String>,
    /// OCR text for the scene, or [`NO_TEXT_MARKER`].
    pub ocr_text: String,
    /// Narration aggregated from transcription segments overlapping the
    /// scene's time window.
    pub narration: String,
}

/// Aggregate counts for the summary sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Total published scenes.
    pub total_scenes: u32,
    /// Scenes whose OCR produced non-empty text.
    pub scenes_with_text: u32,
    /// Total transcription segments that passed the confidence floor.
    pub narration_segments: u32,
    /// Ratio of voiced audio to total duration, from the transcription
    /// pipeline's statistics.
    pub voice_ratio: f64,
    /// Estimated transcription cost saved by VAD gating, in seconds of
    /// audio not sent to a provider.
    pub estimated_savings_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_round_trips() {
        let row = ReportRow {
            scene_number: 3,
            timecode: "00:01:05".into(),
            screenshot_key: Some("scenes/3.jpg".into()),
            ocr_text: NO_TEXT_MARKER.into(),
            narration: String::new(),
        };
        let json = serde_json::to_string(&row).unwrap();
        let back: ReportRow = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }
}
