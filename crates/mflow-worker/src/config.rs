//! Worker configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use mflow_models::WorkerKind;

use crate::error::{WorkerError, WorkerResult};

/// Where task inputs come from and artifacts go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Cloudflare R2 / S3
    R2,
    /// Local filesystem, for development
    Local,
}

impl FromStr for StorageBackend {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "r2" | "s3" => Ok(StorageBackend::R2),
            "local" | "file" => Ok(StorageBackend::Local),
            other => Err(WorkerError::config_error(format!(
                "unknown STORAGE_BACKEND: {}",
                other
            ))),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stage this worker runs
    pub worker_kind: WorkerKind,
    /// Tasks processed concurrently
    pub prefetch: usize,
    /// Parent of the per-task work directories
    pub work_dir: PathBuf,
    pub storage_backend: StorageBackend,
    /// How long shutdown waits for running tasks
    pub shutdown_timeout: Duration,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl WorkerConfig {
    /// Create config from environment variables. `WORKER_KIND` is required.
    pub fn from_env() -> WorkerResult<Self> {
        let worker_kind = std::env::var("WORKER_KIND")
            .map_err(|_| WorkerError::config_error("WORKER_KIND not set"))?
            .parse::<WorkerKind>()
            .map_err(|e| WorkerError::config_error(e.to_string()))?;

        Ok(Self {
            worker_kind,
            prefetch: std::env::var("WORKER_PREFETCH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/mflow")),
            storage_backend: std::env::var("STORAGE_BACKEND")
                .map(|s| s.parse())
                .unwrap_or(Ok(StorageBackend::R2))?,
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            ),
            metrics_enabled: std::env::var("METRICS_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
            metrics_port: std::env::var("METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(9100),
        })
    }
}
