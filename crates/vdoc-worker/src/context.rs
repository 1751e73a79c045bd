//! Shared processing context.
//!
//! All collaborators are constructed once and injected, never global:
//! tests instantiate isolated copies with in-memory backends and mock
//! providers.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use vdoc_checkpoint::CheckpointStore;
use vdoc_media::FfmpegRunner;
use vdoc_providers::{CapabilityGateway, ProviderRouter};
use vdoc_queue::{JobQueue, StatusChannel};
use vdoc_storage::ObjectStoreClient;

use crate::config::WorkerConfig;
use crate::report::ReportSink;

/// Everything a job needs to run.
pub struct ProcessingContext {
    pub config: WorkerConfig,
    pub storage: ObjectStoreClient,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub queue: Arc<JobQueue>,
    pub status: Arc<StatusChannel>,
    /// OCR providers behind the router.
    pub ocr: Arc<ProviderRouter>,
    /// ASR provider gateway; `None` degrades to an empty transcript.
    pub asr: Option<Arc<CapabilityGateway>>,
    /// Where the finished report goes.
    pub report: Arc<dyn ReportSink>,
    pub runner: FfmpegRunner,
    /// Bounds concurrent ffmpeg subprocesses across a job.
    pub ffmpeg_slots: Arc<Semaphore>,
}

impl ProcessingContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WorkerConfig,
        storage: ObjectStoreClient,
        checkpoints: Arc<dyn CheckpointStore>,
        queue: Arc<JobQueue>,
        status: Arc<StatusChannel>,
        ocr: Arc<ProviderRouter>,
        asr: Option<Arc<CapabilityGateway>>,
        report: Arc<dyn ReportSink>,
    ) -> Self {
        let ffmpeg_slots = Arc::new(Semaphore::new(config.max_ffmpeg_processes));
        Self {
            config,
            storage,
            checkpoints,
            queue,
            status,
            ocr,
            asr,
            report,
            runner: FfmpegRunner::new(),
            ffmpeg_slots,
        }
    }

    /// Scratch directory for one upload's temporary files.
    pub fn job_dir(&self, upload_id: &str) -> PathBuf {
        PathBuf::from(&self.config.work_dir).join(upload_id)
    }
}
