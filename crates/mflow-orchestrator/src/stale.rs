//! Report-only detection of tasks that stopped moving.
//!
//! Nothing here changes job state. Recovery stays an operator action
//! through retry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use mflow_models::{Job, JobId, TaskId, TaskStatus, WorkerKind};
use mflow_store::JobStore;

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorResult;
use crate::metrics;

/// A task stuck in `pending` or `running` past the threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleTask {
    pub job_id: JobId,
    pub media_id: String,
    pub task_id: TaskId,
    pub worker_kind: WorkerKind,
    pub status: TaskStatus,
    /// When the task entered its current state
    pub since: DateTime<Utc>,
}

/// Running tasks started more than `threshold` ago, and pending tasks whose
/// job has not been written for that long.
pub fn find_stale_tasks(jobs: &[Job], threshold: Duration, now: DateTime<Utc>) -> Vec<StaleTask> {
    jobs.iter()
        .filter(|job| !job.is_terminal())
        .flat_map(|job| {
            job.tasks.iter().filter_map(move |task| {
                let since = match task.status {
                    TaskStatus::Running => task.start_time.unwrap_or(job.updated_at),
                    TaskStatus::Pending => job.updated_at,
                    TaskStatus::Completed | TaskStatus::Failed => return None,
                };
                let age = (now - since).to_std().ok()?;
                (age >= threshold).then(|| StaleTask {
                    job_id: job.id.clone(),
                    media_id: job.media_id.clone(),
                    task_id: task.id.clone(),
                    worker_kind: task.worker_kind,
                    status: task.status,
                    since,
                })
            })
        })
        .collect()
}

/// Periodically scans active jobs and reports stale tasks.
pub struct StaleTaskDetector {
    store: Arc<dyn JobStore>,
    threshold: Duration,
    interval: Duration,
    scan_limit: usize,
    enabled: bool,
}

impl StaleTaskDetector {
    pub fn new(store: Arc<dyn JobStore>, config: &OrchestratorConfig) -> Self {
        Self {
            store,
            threshold: config.stale_threshold,
            interval: config.stale_check_interval,
            scan_limit: config.stale_scan_limit,
            enabled: config.stale_detection_enabled,
        }
    }

    /// Scan until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.enabled {
            info!("Stale task detection is disabled");
            return;
        }

        info!(
            "Starting stale task detector (interval: {:?}, threshold: {:?})",
            self.interval, self.threshold
        );
        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once().await {
                        error!("Stale task detection error: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Stale task detector stopped");
    }

    /// One scan. Logs each stale task and updates the gauge.
    pub async fn check_once(&self) -> OrchestratorResult<Vec<StaleTask>> {
        let jobs = self.store.list_active_jobs(self.scan_limit).await?;
        let stale = find_stale_tasks(&jobs, self.threshold, Utc::now());

        for task in &stale {
            warn!(
                job_id = %task.job_id,
                media_id = %task.media_id,
                task_id = %task.task_id,
                worker_kind = %task.worker_kind,
                status = %task.status,
                since = %task.since,
                "Task looks stale"
            );
        }
        metrics::set_stale_tasks(stale.len());
        Ok(stale)
    }
}
