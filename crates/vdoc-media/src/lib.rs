//! Media subprocess layer for the VDoc worker.
//!
//! Everything CPU-bound (decoding, frame extraction, scene scoring) is
//! delegated to ffmpeg/ffprobe subprocesses so the event loop never blocks.
//! Every subprocess runs under both a hard ceiling timeout and a stall
//! timeout; no external call is allowed to hang indefinitely.

pub mod audio;
pub mod command;
pub mod error;
pub mod frames;
pub mod probe;
pub mod scene_detect;
pub mod vad;
pub mod voiced;

pub use command::{FfmpegCommand, FfmpegRunner, SubprocessLimits};
pub use error::{MediaError, MediaResult};
pub use probe::{probe_video, MediaInfo};
pub use scene_detect::{detect_scenes, SceneDetectConfig, SceneDetection};
pub use voiced::{TranscriptChunk, VoicedInterval};
