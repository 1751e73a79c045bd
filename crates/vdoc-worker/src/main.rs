//! Video analysis worker binary.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vdoc_checkpoint::RedisCheckpointStore;
use vdoc_providers::{ProviderRouter, RouterConfig};
use vdoc_queue::{JobQueue, StatusChannel};
use vdoc_storage::ObjectStoreClient;
use vdoc_worker::artifacts::StorageArtifactStore;
use vdoc_worker::report::JsonLinesReportSink;
use vdoc_worker::sweeper::run_sweeper;
use vdoc_worker::{JobExecutor, ProcessingContext, WorkerConfig};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Load environment variables
    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("vdoc=info".parse().unwrap())
        .add_directive("aws_config=warn".parse().unwrap())
        .add_directive("aws_sdk_s3=warn".parse().unwrap());

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting vdoc-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    let storage = match ObjectStoreClient::from_env().await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create storage client: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = storage.check_connectivity().await {
        error!("Storage connectivity check failed: {}", e);
        std::process::exit(1);
    }

    let artifacts = Arc::new(StorageArtifactStore::new(storage.clone()));
    let checkpoints = match RedisCheckpointStore::from_env(artifacts) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to create checkpoint store: {}", e);
            std::process::exit(1);
        }
    };

    let queue = match JobQueue::from_env() {
        Ok(q) => Arc::new(q),
        Err(e) => {
            error!("Failed to create job queue: {}", e);
            std::process::exit(1);
        }
    };

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let status = match StatusChannel::new(&redis_url) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Failed to create status channel: {}", e);
            std::process::exit(1);
        }
    };

    // Provider gateways are registered by the deployment-specific build;
    // an empty pool resolves OCR batches to explicit empty results.
    let ocr = Arc::new(ProviderRouter::new(Vec::new(), RouterConfig::default()));
    if ocr.provider_count() == 0 {
        warn!("No OCR providers configured, scenes will report no text");
    }
    let asr = None;

    let report = Arc::new(JsonLinesReportSink::new(storage.clone()));

    let ctx = Arc::new(ProcessingContext::new(
        config.clone(),
        storage,
        checkpoints.clone(),
        queue.clone(),
        status,
        ocr,
        asr,
        report,
    ));

    let executor = Arc::new(JobExecutor::new(ctx));

    let sweeper = tokio::spawn(run_sweeper(
        checkpoints,
        queue,
        config.sweep_interval,
        executor.shutdown_receiver(),
    ));

    {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Received shutdown signal");
            executor.shutdown();
        });
    }

    if let Err(e) = executor.run().await {
        error!("Executor error: {}", e);
        std::process::exit(1);
    }

    sweeper.abort();
    info!("Worker shutdown complete");
}
