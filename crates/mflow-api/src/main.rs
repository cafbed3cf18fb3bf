//! Orchestrator API server binary.
//!
//! Serves the job HTTP surface, consumes task completion and failure events,
//! and runs the stale task reporter.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mflow_api::{create_router, metrics, ApiConfig, AppState};
use mflow_models::Pipeline;
use mflow_orchestrator::{EventConsumers, Orchestrator, OrchestratorConfig, StaleTaskDetector};
use mflow_queue::{MessageChannel, RedisChannel};
use mflow_store::{FirestoreJobStore, JobStore};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // Install rustls crypto provider (required for rustls 0.23+)
    let _ = rustls::crypto::ring::default_provider().install_default();

    init_tracing();

    if let Err(e) = run().await {
        error!("Server failed: {:#}", e);
        std::process::exit(1);
    }

    info!("Server shutdown complete");
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
    info!("Starting mflow-api");

    let config = ApiConfig::from_env();
    let orchestrator_config = OrchestratorConfig::from_env();
    let pipeline = Arc::new(Pipeline::from_env()?);
    let stages: Vec<&str> = pipeline.kinds().map(|k| k.as_str()).collect();
    info!(
        "API config: host={}, port={}, pipeline={}",
        config.host,
        config.port,
        stages.join(",")
    );

    let store: Arc<dyn JobStore> = Arc::new(FirestoreJobStore::from_env().await?);
    store.ping().await?;

    let broker = Arc::new(RedisChannel::from_env().await?);
    broker.ping().await?;
    let broker: Arc<dyn MessageChannel> = broker;

    let metrics_handle = if config.metrics_enabled {
        info!("Prometheus metrics enabled at /metrics");
        Some(metrics::init_metrics()?)
    } else {
        None
    };

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&broker),
        pipeline,
        &orchestrator_config,
    ));

    let events = EventConsumers::start(
        Arc::clone(&broker),
        Arc::clone(&orchestrator),
        orchestrator_config.prefetch,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let detector = StaleTaskDetector::new(Arc::clone(&store), &orchestrator_config);
    let detector_handle = tokio::spawn(async move { detector.run(shutdown_rx).await });

    let state = AppState::new(config.clone(), orchestrator, store, broker);
    let app = create_router(state, metrics_handle);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let _ = shutdown_tx.send(true);
    events.shutdown().await;
    if let Err(e) = detector_handle.await {
        error!("Stale task detector panicked: {}", e);
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
