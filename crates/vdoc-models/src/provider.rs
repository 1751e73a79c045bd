//! Result types for external capability (OCR/ASR) calls.

use serde::{Deserialize, Serialize};

/// Which kind of capability produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Ocr,
    Transcription,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Ocr => "ocr",
            CapabilityKind::Transcription => "transcription",
        }
    }
}

/// One segment as returned by an ASR provider, with timestamps relative to
/// the start of the submitted chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSegment {
    /// Start offset in seconds, relative to the chunk.
    pub start: f64,
    /// End offset in seconds, relative to the chunk.
    pub end: f64,
    /// Transcribed text.
    pub text: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Output of one external capability call. Provider identity and latency are
/// retained for auditing and load-balancing decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutput {
    /// Recognized text. For ASR this is the concatenated segment text.
    pub text: String,
    /// Overall confidence in `[0, 1]`.
    pub confidence: f64,
    /// Name of the provider that produced this result.
    pub provider: String,
    /// Wall-clock latency of the successful call, in milliseconds.
    pub latency_ms: u64,
    /// Timestamped segments, present for ASR results only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<RawSegment>,
}

impl CapabilityOutput {
    /// An explicit empty result, used when every provider was unavailable
    /// so that batch completion is never blocked on provider availability.
    pub fn empty(provider: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
            provider: provider.into(),
            latency_ms: 0,
            segments: Vec::new(),
        }
    }

    /// Whether this result carries no usable text.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_output() {
        let out = CapabilityOutput::empty("none");
        assert!(out.is_empty());
        assert_eq!(out.provider, "none");
    }

    #[test]
    fn test_segments_skipped_when_empty() {
        let out = CapabilityOutput {
            text: "hello".into(),
            confidence: 0.8,
            provider: "mock".into(),
            latency_ms: 12,
            segments: Vec::new(),
        };
        let json = serde_json::to_string(&out).unwrap();
        assert!(!json.contains("segments"));
    }
}
