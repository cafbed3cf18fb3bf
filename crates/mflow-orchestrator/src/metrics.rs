//! Pipeline metrics.

use metrics::{counter, gauge};

use mflow_models::WorkerKind;

pub mod names {
    pub const JOBS_CREATED_TOTAL: &str = "mflow_jobs_created_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "mflow_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "mflow_jobs_failed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "mflow_jobs_retried_total";
    pub const TASKS_DISPATCHED_TOTAL: &str = "mflow_tasks_dispatched_total";
    pub const TASKS_COMPLETED_TOTAL: &str = "mflow_tasks_completed_total";
    pub const TASKS_FAILED_TOTAL: &str = "mflow_tasks_failed_total";
    pub const DISPATCH_FAILURES_TOTAL: &str = "mflow_dispatch_failures_total";
    pub const SAVE_CONFLICTS_TOTAL: &str = "mflow_job_save_conflicts_total";
    pub const EVENTS_DROPPED_TOTAL: &str = "mflow_events_dropped_total";
    pub const STALE_TASKS: &str = "mflow_stale_tasks";
}

pub fn record_job_created() {
    counter!(names::JOBS_CREATED_TOTAL).increment(1);
}

pub fn record_job_completed() {
    counter!(names::JOBS_COMPLETED_TOTAL).increment(1);
}

pub fn record_job_failed(kind: WorkerKind) {
    let labels = [("worker_kind", kind.as_str().to_string())];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_job_retried() {
    counter!(names::JOBS_RETRIED_TOTAL).increment(1);
}

pub fn record_task_dispatched(kind: WorkerKind) {
    let labels = [("worker_kind", kind.as_str().to_string())];
    counter!(names::TASKS_DISPATCHED_TOTAL, &labels).increment(1);
}

pub fn record_task_completed(kind: WorkerKind) {
    let labels = [("worker_kind", kind.as_str().to_string())];
    counter!(names::TASKS_COMPLETED_TOTAL, &labels).increment(1);
}

pub fn record_task_failed(kind: WorkerKind) {
    let labels = [("worker_kind", kind.as_str().to_string())];
    counter!(names::TASKS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_dispatch_failure(kind: WorkerKind) {
    let labels = [("worker_kind", kind.as_str().to_string())];
    counter!(names::DISPATCH_FAILURES_TOTAL, &labels).increment(1);
}

pub fn record_save_conflict(operation: &'static str) {
    counter!(names::SAVE_CONFLICTS_TOTAL, "operation" => operation).increment(1);
}

pub fn record_event_dropped(event: &'static str) {
    counter!(names::EVENTS_DROPPED_TOTAL, "event" => event).increment(1);
}

pub fn set_stale_tasks(count: usize) {
    gauge!(names::STALE_TASKS).set(count as f64);
}
