//! Pipeline step state machine.
//!
//! Steps are strictly ordered. A checkpoint stores the step currently being
//! worked on; everything before it is complete and is skipped on resume.
//! There is no backward transition, and there is no explicit terminal step:
//! a finished job's checkpoint is deleted, not marked done.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of the processing pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStep {
    /// Downloading the uploaded video from object storage.
    #[default]
    Downloading,
    /// Extracting the audio track.
    AudioExtraction,
    /// VAD-gated speech transcription.
    Transcription,
    /// Visual scene-cut detection.
    SceneDetection,
    /// Per-scene frame OCR.
    Ocr,
    /// Final report assembly.
    ReportGeneration,
}

impl ProcessingStep {
    /// All steps in pipeline order.
    pub const ALL: [ProcessingStep; 6] = [
        ProcessingStep::Downloading,
        ProcessingStep::AudioExtraction,
        ProcessingStep::Transcription,
        ProcessingStep::SceneDetection,
        ProcessingStep::Ocr,
        ProcessingStep::ReportGeneration,
    ];

    /// Position of this step in the pipeline.
    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).unwrap_or(0)
    }

    /// Whether `candidate` still needs to run when the checkpoint is
    /// currently at `self`. Steps already passed are skipped on resume.
    pub fn should_run(&self, candidate: ProcessingStep) -> bool {
        self.index() <= candidate.index()
    }

    /// The step after this one, if any.
    pub fn next(&self) -> Option<ProcessingStep> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStep::Downloading => "downloading",
            ProcessingStep::AudioExtraction => "audio_extraction",
            ProcessingStep::Transcription => "transcription",
            ProcessingStep::SceneDetection => "scene_detection",
            ProcessingStep::Ocr => "ocr",
            ProcessingStep::ReportGeneration => "report_generation",
        }
    }
}

impl fmt::Display for ProcessingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_order() {
        let steps = ProcessingStep::ALL;
        for pair in steps.windows(2) {
            assert!(pair[0].index() < pair[1].index());
        }
    }

    #[test]
    fn test_should_run_skips_passed_steps() {
        let current = ProcessingStep::SceneDetection;
        assert!(!current.should_run(ProcessingStep::Downloading));
        assert!(!current.should_run(ProcessingStep::Transcription));
        assert!(current.should_run(ProcessingStep::SceneDetection));
        assert!(current.should_run(ProcessingStep::Ocr));
        assert!(current.should_run(ProcessingStep::ReportGeneration));
    }

    #[test]
    fn test_next_step() {
        assert_eq!(
            ProcessingStep::Downloading.next(),
            Some(ProcessingStep::AudioExtraction)
        );
        assert_eq!(ProcessingStep::ReportGeneration.next(), None);
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&ProcessingStep::AudioExtraction).unwrap();
        assert_eq!(json, "\"audio_extraction\"");
        let step: ProcessingStep = serde_json::from_str("\"scene_detection\"").unwrap();
        assert_eq!(step, ProcessingStep::SceneDetection);
    }
}
