//! Worker configuration.

use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,
    /// Maximum concurrent FFmpeg processes per job
    pub max_ffmpeg_processes: usize,
    /// Concurrent audio chunks in transcription
    pub chunk_concurrency: usize,
    /// Persist transcription progress every this many completed chunks
    pub chunk_checkpoint_interval: usize,
    /// Scenes per OCR batch
    pub ocr_batch_size: u32,
    /// Consecutive terminal failures after which a batch's job is
    /// permanently failed
    pub max_batch_failures: u32,
    /// Concurrent frame extractions per batch
    pub frame_concurrency: usize,
    /// Segments below this confidence are excluded from narration
    pub narration_confidence_floor: f64,
    /// Job timeout
    pub job_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Work directory for temporary files
    pub work_dir: String,
    /// How often the worker should scan for orphaned pending jobs
    pub claim_interval: Duration,
    /// Minimum idle time before a pending job can be claimed (crash recovery)
    pub claim_min_idle: Duration,
    /// Interval between status heartbeats while a job runs
    pub heartbeat_interval: Duration,
    /// Interval between checkpoint expiry sweeps
    pub sweep_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            max_ffmpeg_processes: 4,
            chunk_concurrency: 5,
            chunk_checkpoint_interval: 5,
            ocr_batch_size: 10,
            max_batch_failures: 3,
            frame_concurrency: 4,
            narration_confidence_floor: 0.5,
            job_timeout: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(30),
            work_dir: "/tmp/vdoc".to_string(),
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_jobs: env_parse("WORKER_MAX_JOBS", defaults.max_concurrent_jobs),
            max_ffmpeg_processes: env_parse("WORKER_MAX_FFMPEG", defaults.max_ffmpeg_processes),
            chunk_concurrency: env_parse("WORKER_CHUNK_CONCURRENCY", defaults.chunk_concurrency),
            chunk_checkpoint_interval: env_parse(
                "WORKER_CHUNK_CHECKPOINT_INTERVAL",
                defaults.chunk_checkpoint_interval,
            ),
            ocr_batch_size: env_parse("WORKER_OCR_BATCH_SIZE", defaults.ocr_batch_size),
            max_batch_failures: env_parse("WORKER_MAX_BATCH_FAILURES", defaults.max_batch_failures),
            frame_concurrency: env_parse("WORKER_FRAME_CONCURRENCY", defaults.frame_concurrency),
            narration_confidence_floor: env_parse(
                "WORKER_NARRATION_CONFIDENCE_FLOOR",
                defaults.narration_confidence_floor,
            ),
            job_timeout: Duration::from_secs(env_parse("WORKER_JOB_TIMEOUT", 3600)),
            shutdown_timeout: Duration::from_secs(env_parse("WORKER_SHUTDOWN_TIMEOUT", 30)),
            work_dir: std::env::var("WORKER_WORK_DIR").unwrap_or(defaults.work_dir),
            claim_interval: Duration::from_secs(env_parse("WORKER_CLAIM_INTERVAL_SECS", 30)),
            claim_min_idle: Duration::from_secs(env_parse("WORKER_CLAIM_MIN_IDLE_SECS", 300)),
            heartbeat_interval: Duration::from_secs(env_parse("WORKER_HEARTBEAT_SECS", 60)),
            sweep_interval: Duration::from_secs(env_parse("WORKER_SWEEP_INTERVAL_SECS", 3600)),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
