//! Stage worker binary.

use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mflow_media::{check_ffmpeg, check_ffprobe, MediaConfig, ProcessorRegistry};
use mflow_models::WorkerKind;
use mflow_queue::{Channel, Consumer, ConsumerConfig, MessageChannel, RedisChannel};
use mflow_storage::{LocalStorage, R2Client, Storage};
use mflow_store::{FirestoreJobStore, JobStore};
use mflow_worker::{StorageBackend, WorkerConfig, WorkerShell};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    let _ = rustls::crypto::ring::default_provider().install_default();

    dotenvy::dotenv().ok();
    init_tracing();

    if let Err(e) = run().await {
        error!("Worker failed: {:#}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mflow=info"));

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
}

async fn run() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env()?;
    info!(worker_kind = %config.worker_kind, "Starting mflow-worker");
    info!("Worker config: {:?}", config);

    if config.metrics_enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Metrics listening on {}", addr);
    }

    if matches!(config.worker_kind, WorkerKind::Thumbnail | WorkerKind::Transcode) {
        let ffmpeg = check_ffmpeg()?;
        let ffprobe = check_ffprobe()?;
        info!(ffmpeg = %ffmpeg.display(), ffprobe = %ffprobe.display(), "FFmpeg available");
    }

    let store: Arc<dyn JobStore> = Arc::new(FirestoreJobStore::from_env().await?);
    store.ping().await?;

    let broker = Arc::new(RedisChannel::from_env().await?);
    broker.ping().await?;
    let broker: Arc<dyn MessageChannel> = broker;

    let storage: Arc<dyn Storage> = match config.storage_backend {
        StorageBackend::R2 => {
            let client = R2Client::from_env()?;
            client.check_connectivity().await?;
            Arc::new(client)
        }
        StorageBackend::Local => Arc::new(LocalStorage::from_env()?),
    };

    let media = MediaConfig::from_env(config.worker_kind);
    let processor = ProcessorRegistry::for_kind(config.worker_kind, &media)?;
    let shell = WorkerShell::new(
        processor,
        store,
        Arc::clone(&broker),
        storage,
        config.work_dir.clone(),
    )
    .with_options(media.options);

    let consumer = Arc::new(Consumer::new(
        broker,
        ConsumerConfig {
            shutdown_timeout: config.shutdown_timeout,
            ..ConsumerConfig::from_env()
        }
        .with_prefetch(config.prefetch)
        .with_name_prefix(format!("worker-{}", config.worker_kind)),
    ));

    let signal_consumer = Arc::clone(&consumer);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_consumer.shutdown();
        }
    });

    consumer
        .run(Channel::Tasks(config.worker_kind), Arc::new(shell))
        .await?;
    Ok(())
}
