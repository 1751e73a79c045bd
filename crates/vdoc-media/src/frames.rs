//! Representative frame extraction.

use std::path::Path;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::MediaResult;

/// Extract a single JPEG frame at `instant_secs` into `out_path`.
pub async fn extract_frame(
    runner: &FfmpegRunner,
    video: impl AsRef<Path>,
    instant_secs: f64,
    out_path: impl AsRef<Path>,
) -> MediaResult<()> {
    let cmd = FfmpegCommand::new(video, out_path)
        .seek(instant_secs)
        .single_frame()
        .output_arg("-q:v")
        .output_arg("2");

    runner.run(&cmd).await?;
    Ok(())
}

/// Extract a single frame and return its JPEG bytes.
pub async fn extract_frame_bytes(
    runner: &FfmpegRunner,
    video: impl AsRef<Path>,
    instant_secs: f64,
    out_path: impl AsRef<Path>,
) -> MediaResult<Vec<u8>> {
    extract_frame(runner, video, instant_secs, &out_path).await?;
    Ok(tokio::fs::read(out_path.as_ref()).await?)
}
