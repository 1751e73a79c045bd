//! Audio extraction and raw sample loading.
//!
//! All decoding goes through ffmpeg subprocesses. VAD consumes 16 kHz mono
//! f32 samples; chunk files handed to ASR providers are 16 kHz mono WAV.

use std::path::Path;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};

/// Sample rate used for VAD and ASR chunk files.
pub const AUDIO_SAMPLE_RATE: u32 = 16_000;

/// Extract the audio track of a video to a 16 kHz mono WAV file.
pub async fn extract_audio(
    runner: &FfmpegRunner,
    video: impl AsRef<Path>,
    out_wav: impl AsRef<Path>,
) -> MediaResult<()> {
    let cmd = FfmpegCommand::new(video, out_wav)
        .no_video()
        .output_arg("-ac")
        .output_arg("1")
        .output_arg("-ar")
        .output_arg(AUDIO_SAMPLE_RATE.to_string())
        .output_arg("-c:a")
        .output_arg("pcm_s16le");

    runner.run(&cmd).await?;
    Ok(())
}

/// Extract one chunk of an audio file to its own short WAV file.
pub async fn extract_audio_chunk(
    runner: &FfmpegRunner,
    audio: impl AsRef<Path>,
    start_secs: f64,
    duration_secs: f64,
    out_wav: impl AsRef<Path>,
) -> MediaResult<()> {
    let cmd = FfmpegCommand::new(audio, out_wav)
        .seek(start_secs)
        .duration(duration_secs)
        .output_arg("-ac")
        .output_arg("1")
        .output_arg("-ar")
        .output_arg(AUDIO_SAMPLE_RATE.to_string())
        .output_arg("-c:a")
        .output_arg("pcm_s16le");

    runner.run(&cmd).await?;
    Ok(())
}

/// Decode a slice of an audio file to raw f32 samples at the VAD rate.
///
/// `duration_secs` of `None` decodes to the end of the file.
pub async fn load_samples(
    runner: &FfmpegRunner,
    audio: impl AsRef<Path>,
    start_secs: f64,
    duration_secs: Option<f64>,
) -> MediaResult<Vec<f32>> {
    let tmp = tempfile::NamedTempFile::new()?;

    let mut cmd = FfmpegCommand::new(audio, tmp.path())
        .seek(start_secs)
        .no_video()
        .output_arg("-ac")
        .output_arg("1")
        .output_arg("-ar")
        .output_arg(AUDIO_SAMPLE_RATE.to_string())
        .output_arg("-f")
        .output_arg("s16le");
    if let Some(duration) = duration_secs {
        cmd = cmd.duration(duration);
    }

    runner.run(&cmd).await?;

    let bytes = tokio::fs::read(tmp.path()).await?;
    if bytes.is_empty() {
        return Err(MediaError::NoAudioData);
    }

    Ok(samples_from_s16le(&bytes))
}

/// Convert raw little-endian s16 PCM bytes to f32 samples in `[-1, 1]`.
pub fn samples_from_s16le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / i16::MAX as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s16le_conversion() {
        let bytes = [0x00, 0x00, 0xFF, 0x7F, 0x01, 0x80];
        let samples = samples_from_s16le(&bytes);
        assert_eq!(samples.len(), 3);
        assert!((samples[0]).abs() < 1e-6);
        assert!((samples[1] - 1.0).abs() < 1e-6);
        assert!(samples[2] < -0.99);
    }

    #[test]
    fn test_odd_trailing_byte_ignored() {
        let samples = samples_from_s16le(&[0x00, 0x00, 0xAB]);
        assert_eq!(samples.len(), 1);
    }
}
