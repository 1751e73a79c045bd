//! Silero VAD v5 wrapper.
//!
//! Thin abstraction over the `voice_activity_detector` crate. Silero v5
//! wants fixed frame sizes: 512 samples at 16 kHz, 256 at 8 kHz (~32 ms).

use tracing::debug;
use voice_activity_detector::VoiceActivityDetector;

use crate::error::{MediaError, MediaResult};

/// Speech-probability detector for fixed-size audio frames.
pub struct SpeechDetector {
    vad: VoiceActivityDetector,
    sample_rate: usize,
    frame_size: usize,
}

impl SpeechDetector {
    /// Create a detector for the given sample rate (8000 or 16000).
    pub fn new(sample_rate: usize) -> MediaResult<Self> {
        let frame_size = match sample_rate {
            8000 => 256,
            16000 => 512,
            _ => {
                return Err(MediaError::Vad(format!(
                    "Sample rate must be 8000 or 16000, got {}",
                    sample_rate
                )));
            }
        };

        let vad = VoiceActivityDetector::builder()
            .sample_rate(sample_rate as i64)
            .chunk_size(frame_size)
            .build()
            .map_err(|e| MediaError::Vad(format!("Failed to create VAD: {:?}", e)))?;

        debug!(sample_rate, frame_size, "Initialized Silero VAD v5");

        Ok(Self {
            vad,
            sample_rate,
            frame_size,
        })
    }

    /// Expected samples per frame.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Frame duration in milliseconds.
    pub fn frame_duration_ms(&self) -> u64 {
        (self.frame_size * 1000 / self.sample_rate) as u64
    }

    /// Speech probability for one frame of f32 samples in `[-1, 1]`.
    pub fn predict(&mut self, samples: &[f32]) -> f32 {
        self.vad.predict(samples.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detector_creation() {
        assert!(SpeechDetector::new(16000).is_ok());
        assert!(SpeechDetector::new(8000).is_ok());
    }

    #[test]
    fn test_invalid_sample_rate() {
        assert!(SpeechDetector::new(44100).is_err());
    }

    #[test]
    fn test_frame_geometry() {
        let vad = SpeechDetector::new(16000).unwrap();
        assert_eq!(vad.frame_size(), 512);
        assert_eq!(vad.frame_duration_ms(), 32);
    }

    #[test]
    fn test_silence_scores_low() {
        let mut vad = SpeechDetector::new(16000).unwrap();
        let silence = vec![0.0f32; vad.frame_size()];
        assert!(vad.predict(&silence) < 0.5);
    }
}
