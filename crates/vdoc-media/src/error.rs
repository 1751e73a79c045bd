//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur during media processing.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("FFprobe not found in PATH")]
    FfprobeNotFound,

    #[error("FFmpeg command failed: {message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("FFprobe command failed: {message}")]
    FfprobeFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Subprocess timed out after {0} seconds")]
    Timeout(u64),

    #[error("Subprocess produced no output for {0} seconds, killed")]
    Stalled(u64),

    #[error("Invalid video file: {0}")]
    InvalidVideo(String),

    #[error("No audio data found in file")]
    NoAudioData,

    #[error("VAD inference failed: {0}")]
    Vad(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl MediaError {
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    /// Fatal input errors abort the job immediately; everything else is a
    /// candidate for retry or degraded continuation.
    pub fn is_fatal_input(&self) -> bool {
        matches!(
            self,
            MediaError::InvalidVideo(_) | MediaError::FileNotFound(_)
        )
    }
}
