//! The job aggregate.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{Pipeline, Task, TaskId, TaskOutput, TaskStatus, WorkerKind};

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Stages remain to be run
    #[default]
    Pending,
    /// Reserved for deployments that track an explicit in-progress phase
    Running,
    /// Every stage completed
    Completed,
    /// A stage failed; retryable
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// One media item's end-to-end processing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// External media reference
    pub media_id: String,

    /// Original input location, reused on retry
    pub source_url: String,

    #[serde(default)]
    pub status: JobStatus,

    /// Tasks in pipeline order
    #[serde(default)]
    pub tasks: Vec<Task>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,

    /// Error copied from the failed task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Store concurrency token; `None` until first persisted.
    #[serde(skip)]
    pub revision: Option<String>,
}

impl Job {
    /// Create a job with a single pending task for the first stage.
    pub fn new(
        media_id: impl Into<String>,
        source_url: impl Into<String>,
        first_stage: WorkerKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            media_id: media_id.into(),
            source_url: source_url.into(),
            status: JobStatus::Pending,
            tasks: vec![Task::new(first_stage)],
            output_url: None,
            error: None,
            created_at: now,
            updated_at: now,
            revision: None,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.revision.is_some()
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }

    pub fn task_for_kind(&self, kind: WorkerKind) -> Option<&Task> {
        self.tasks.iter().find(|t| t.worker_kind == kind)
    }

    /// Earliest pending task by pipeline order.
    pub fn earliest_pending_task(&self, pipeline: &Pipeline) -> Option<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .min_by_key(|t| pipeline.position(t.worker_kind).unwrap_or(usize::MAX))
    }

    /// Append a pending task for `kind` unless one already exists.
    ///
    /// Returns the new task, or `None` when the stage already has one.
    pub fn append_task(&mut self, kind: WorkerKind) -> Option<&Task> {
        if self.task_for_kind(kind).is_some() {
            return None;
        }
        self.tasks.push(Task::new(kind));
        self.updated_at = Utc::now();
        self.tasks.last()
    }

    /// Outputs of completed tasks, in task order.
    pub fn completed_outputs(&self) -> impl Iterator<Item = &TaskOutput> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter_map(|t| t.output.as_ref())
    }

    /// Whether every stage of `pipeline` has a completed task.
    pub fn all_stages_completed(&self, pipeline: &Pipeline) -> bool {
        pipeline.kinds().all(|kind| {
            self.task_for_kind(kind)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        })
    }

    pub fn mark_completed(&mut self, output_url: Option<String>) {
        self.status = JobStatus::Completed;
        if output_url.is_some() {
            self.output_url = output_url;
        }
        self.error = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// Reset failed tasks to pending and clear the job error.
    ///
    /// Completed tasks and their outputs are left untouched. Returns the
    /// number of tasks reset.
    pub fn reset_for_retry(&mut self) -> usize {
        let mut reset = 0;
        for task in self.tasks.iter_mut().filter(|t| t.status == TaskStatus::Failed) {
            task.reset();
            reset += 1;
        }
        self.status = JobStatus::Pending;
        self.error = None;
        self.updated_at = Utc::now();
        reset
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ThumbnailOutput, TranscodeOutput};

    fn two_stage() -> Pipeline {
        Pipeline::from_kinds([WorkerKind::Thumbnail, WorkerKind::Transcode]).unwrap()
    }

    #[test]
    fn test_job_creation() {
        let job = Job::new("m1", "s3://m1.mp4", WorkerKind::Thumbnail);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.tasks.len(), 1);
        assert_eq!(job.tasks[0].worker_kind, WorkerKind::Thumbnail);
        assert_eq!(job.tasks[0].status, TaskStatus::Pending);
        assert!(!job.is_persisted());
    }

    #[test]
    fn test_append_task_once_per_stage() {
        let mut job = Job::new("m1", "s3://m1.mp4", WorkerKind::Thumbnail);

        assert!(job.append_task(WorkerKind::Transcode).is_some());
        assert!(job.append_task(WorkerKind::Transcode).is_none());
        assert_eq!(job.tasks.len(), 2);
    }

    #[test]
    fn test_earliest_pending_follows_pipeline_order() {
        let pipeline = two_stage();
        let mut job = Job::new("m1", "s3://m1.mp4", WorkerKind::Transcode);
        job.append_task(WorkerKind::Thumbnail);

        let next = job.earliest_pending_task(&pipeline).unwrap();
        assert_eq!(next.worker_kind, WorkerKind::Thumbnail);
    }

    #[test]
    fn test_reset_for_retry_keeps_completed_outputs() {
        let now = Utc::now();
        let mut job = Job::new("m1", "s3://m1.mp4", WorkerKind::Thumbnail);
        let thumb = TaskOutput::Thumbnail(ThumbnailOutput {
            thumbnail_url: "s3://out/t.jpg".into(),
            width: None,
            height: None,
        });
        {
            let task = &mut job.tasks[0];
            task.apply_status(TaskStatus::Running, None, now).unwrap();
            task.record_output(thumb.clone());
            task.apply_status(TaskStatus::Completed, None, now).unwrap();
        }
        job.append_task(WorkerKind::Transcode);
        job.tasks[1].record_failure("encoder exited with 1", now);
        job.mark_failed("encoder exited with 1");

        assert_eq!(job.reset_for_retry(), 1);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error.is_none());
        assert_eq!(job.tasks[0].output.as_ref(), Some(&thumb));
        assert_eq!(job.tasks[1].status, TaskStatus::Pending);
        assert_eq!(
            job.earliest_pending_task(&two_stage()).map(|t| t.worker_kind),
            Some(WorkerKind::Transcode)
        );
    }

    #[test]
    fn test_all_stages_completed() {
        let now = Utc::now();
        let pipeline = Pipeline::from_kinds([WorkerKind::Transcode]).unwrap();
        let mut job = Job::new("m1", "s3://m1.mp4", WorkerKind::Transcode);
        assert!(!job.all_stages_completed(&pipeline));

        job.tasks[0].apply_status(TaskStatus::Running, None, now).unwrap();
        job.tasks[0].record_output(TaskOutput::Transcode(TranscodeOutput {
            output_url: "s3://out/1080.mp4".into(),
            renditions: vec![],
        }));
        job.tasks[0].apply_status(TaskStatus::Completed, None, now).unwrap();

        assert!(job.all_stages_completed(&pipeline));
        assert_eq!(job.completed_outputs().count(), 1);
    }

    #[test]
    fn test_revision_not_serialized() {
        let mut job = Job::new("m1", "s3://m1.mp4", WorkerKind::Thumbnail);
        job.revision = Some("rev-1".into());

        let json = serde_json::to_value(&job).unwrap();
        assert!(json.get("revision").is_none());
        assert_eq!(json["mediaId"], "m1");
    }
}
