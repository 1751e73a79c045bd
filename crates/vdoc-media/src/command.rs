//! FFmpeg command builder and runner.
//!
//! The runner enforces two independent timeouts on every invocation: a hard
//! ceiling on total runtime, and a stall timeout that kills the subprocess
//! when it stops producing output even though the ceiling has not elapsed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{MediaError, MediaResult};

/// Cap on captured stderr, enough for scene-score parsing on long videos.
const MAX_CAPTURED_STDERR_BYTES: usize = 8 * 1024 * 1024;

/// Timeout pair applied to every subprocess invocation.
#[derive(Debug, Clone, Copy)]
pub struct SubprocessLimits {
    /// Hard ceiling on total runtime.
    pub hard_timeout: Duration,
    /// Kill the subprocess when it emits no output for this long.
    pub stall_timeout: Duration,
}

impl Default for SubprocessLimits {
    fn default() -> Self {
        Self {
            hard_timeout: Duration::from_secs(1800),
            stall_timeout: Duration::from_secs(120),
        }
    }
}

/// Builder for FFmpeg commands.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    input: PathBuf,
    /// Output path, or `-` when output is discarded (`-f null`).
    output: String,
    input_args: Vec<String>,
    output_args: Vec<String>,
    overwrite: bool,
    log_level: String,
}

impl FfmpegCommand {
    /// Create a command writing to an output file.
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_string_lossy().into_owned(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            overwrite: true,
            log_level: "error".to_string(),
        }
    }

    /// Create a command that discards its output (`-f null -`). Used for
    /// analysis passes that only produce filter log lines.
    pub fn new_null_output(input: impl AsRef<Path>) -> Self {
        let mut cmd = Self::new(input, "-");
        cmd.output_args.push("-f".to_string());
        cmd.output_args.push("null".to_string());
        cmd
    }

    /// Add an input argument (before `-i`).
    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    /// Add an output argument (after `-i`).
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    /// Seek to a position before decoding.
    pub fn seek(self, seconds: f64) -> Self {
        self.input_arg("-ss").input_arg(format!("{:.3}", seconds))
    }

    /// Limit the decoded duration.
    pub fn duration(self, seconds: f64) -> Self {
        self.output_arg("-t").output_arg(format!("{:.3}", seconds))
    }

    /// Set a video filter chain.
    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.output_arg("-vf").output_arg(filter)
    }

    /// Extract a single frame.
    pub fn single_frame(self) -> Self {
        self.output_arg("-vframes").output_arg("1")
    }

    /// Drop the video stream.
    pub fn no_video(self) -> Self {
        self.output_arg("-vn")
    }

    /// Drop the audio stream.
    pub fn no_audio(self) -> Self {
        self.output_arg("-an")
    }

    /// Set the ffmpeg log level. Filters that print via the log system
    /// (e.g. `metadata=print`) need at least `info`.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Build the full argument list.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.overwrite {
            args.push("-y".to_string());
        }

        args.push("-v".to_string());
        args.push(self.log_level.clone());

        args.extend(self.input_args.clone());

        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().to_string());

        args.extend(self.output_args.clone());

        args.push(self.output.clone());

        args
    }
}

/// Runner for FFmpeg commands with hard and stall timeouts.
#[derive(Clone)]
pub struct FfmpegRunner {
    limits: SubprocessLimits,
}

impl Default for FfmpegRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegRunner {
    pub fn new() -> Self {
        Self {
            limits: SubprocessLimits::default(),
        }
    }

    pub fn with_limits(limits: SubprocessLimits) -> Self {
        Self { limits }
    }

    /// Run the command to completion, returning captured stderr.
    pub async fn run(&self, cmd: &FfmpegCommand) -> MediaResult<String> {
        which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)?;

        let args = cmd.build_args();
        debug!("Running FFmpeg: ffmpeg {}", args.join(" "));

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::ffmpeg_failed("stderr not captured", None, None))?;

        // The reader task forwards an activity timestamp so the wait loop
        // can detect a stalled subprocess.
        let (activity_tx, activity_rx) = watch::channel(Instant::now());
        let collector = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut captured = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = activity_tx.send(Instant::now());
                if captured.len() < MAX_CAPTURED_STDERR_BYTES {
                    captured.push_str(&line);
                    captured.push('\n');
                }
            }
            captured
        });

        let status = self.wait_with_limits(&mut child, activity_rx).await;
        let captured = collector.await.unwrap_or_default();

        match status {
            Ok(status) if status.success() => Ok(captured),
            Ok(status) => Err(MediaError::ffmpeg_failed(
                "FFmpeg exited with failure",
                Some(tail(&captured, 4096)),
                status.code(),
            )),
            Err(e) => Err(e),
        }
    }

    async fn wait_with_limits(
        &self,
        child: &mut tokio::process::Child,
        activity_rx: watch::Receiver<Instant>,
    ) -> MediaResult<std::process::ExitStatus> {
        let deadline = Instant::now() + self.limits.hard_timeout;
        let mut stall_check = tokio::time::interval(Duration::from_secs(1));
        stall_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                status = child.wait() => return Ok(status?),
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        timeout_secs = self.limits.hard_timeout.as_secs(),
                        "FFmpeg exceeded hard timeout, killing"
                    );
                    child.kill().await.ok();
                    return Err(MediaError::Timeout(self.limits.hard_timeout.as_secs()));
                }
                _ = stall_check.tick() => {
                    let idle = activity_rx.borrow().elapsed();
                    if idle >= self.limits.stall_timeout {
                        warn!(
                            idle_secs = idle.as_secs(),
                            "FFmpeg produced no output, killing"
                        );
                        child.kill().await.ok();
                        return Err(MediaError::Stalled(self.limits.stall_timeout.as_secs()));
                    }
                }
            }
        }
    }
}

fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    // The cut may land inside a multibyte character (ffmpeg stderr echoes
    // filenames and metadata); advance to the next char boundary.
    let mut idx = s.len() - max;
    while !s.is_char_boundary(idx) {
        idx += 1;
    }
    s[idx..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_basic() {
        let cmd = FfmpegCommand::new("/in.mp4", "/out.wav")
            .no_video()
            .output_arg("-ar")
            .output_arg("16000");
        let args = cmd.build_args();
        assert_eq!(args[0], "-y");
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/in.mp4");
        assert_eq!(args.last().unwrap(), "/out.wav");
        assert!(args.contains(&"-vn".to_string()));
    }

    #[test]
    fn test_null_output_command() {
        let cmd = FfmpegCommand::new_null_output("/in.mp4").no_audio();
        let args = cmd.build_args();
        assert_eq!(args.last().unwrap(), "-");
        let f = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(args[f + 1], "null");
    }

    #[test]
    fn test_seek_is_input_side() {
        let cmd = FfmpegCommand::new("/in.mp4", "/out.jpg").seek(12.5);
        let args = cmd.build_args();
        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < i);
        assert_eq!(args[ss + 1], "12.500");
    }

    #[test]
    fn test_tail_truncation() {
        let s = "abcdef";
        assert_eq!(tail(s, 3), "def");
        assert_eq!(tail(s, 10), "abcdef");
    }

    #[test]
    fn test_tail_cut_inside_multibyte_char() {
        // 'é' is two bytes; a cut at byte 1 must not panic and must drop
        // the partial character.
        let s = format!("é{}", "x".repeat(4095));
        let tailed = tail(&s, 4096);
        assert_eq!(tailed.len(), 4095);
        assert!(tailed.chars().all(|c| c == 'x'));

        // Cut landing exactly on a boundary keeps the full character.
        assert_eq!(tail("aé", 2), "é");
        assert_eq!(tail("aéb", 2), "b");
    }
}
