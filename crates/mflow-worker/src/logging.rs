//! Structured task logging.
//!
//! Gives every line of a task's lifecycle the same job, task and stage
//! fields, plus a span to run the task under.

use tracing::{error, info, warn, Span};

use mflow_models::{JobId, TaskId, WorkerKind};

#[derive(Debug, Clone)]
pub struct TaskLogger {
    job_id: String,
    task_id: String,
    worker_kind: WorkerKind,
}

impl TaskLogger {
    pub fn new(job_id: &JobId, task_id: &TaskId, worker_kind: WorkerKind) -> Self {
        Self {
            job_id: job_id.to_string(),
            task_id: task_id.to_string(),
            worker_kind,
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            task_id = %self.task_id,
            worker_kind = %self.worker_kind,
            "Task started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            task_id = %self.task_id,
            worker_kind = %self.worker_kind,
            "Task progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            task_id = %self.task_id,
            worker_kind = %self.worker_kind,
            "Task warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            task_id = %self.task_id,
            worker_kind = %self.worker_kind,
            "Task error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            task_id = %self.task_id,
            worker_kind = %self.worker_kind,
            "Task completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Span to instrument the task's future with.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "task",
            job_id = %self.job_id,
            task_id = %self.task_id,
            worker_kind = %self.worker_kind
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_logger_fields() {
        let logger = TaskLogger::new(
            &JobId::from_string("job-1"),
            &TaskId::from_string("task-1"),
            WorkerKind::Ai,
        );
        assert_eq!(logger.job_id(), "job-1");
        assert_eq!(logger.task_id(), "task-1");
    }
}
