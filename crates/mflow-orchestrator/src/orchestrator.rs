//! Job lifecycle use cases: create, advance on completion or failure, retry.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use mflow_models::{
    CreateJobRequest, Job, JobId, JobStatus, Pipeline, Task, TaskId, TaskOutput, TaskStatus,
    WorkerKind,
};
use mflow_queue::{MessageChannel, TaskCompletedEvent, TaskFailedEvent};
use mflow_store::{JobStore, StoreError};

use crate::config::OrchestratorConfig;
use crate::dispatcher::TaskDispatcher;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::metrics;
use crate::payload::build_task_message;

/// Stored on a task whose failure event carried no message.
const DEFAULT_FAILURE_MESSAGE: &str = "Task failed";

/// What a completion event led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// The next stage's task was appended and dispatched.
    Dispatched {
        task_id: TaskId,
        worker_kind: WorkerKind,
    },
    /// The next stage's task already existed but was still pending, so its
    /// message was published again.
    Redispatched {
        task_id: TaskId,
        worker_kind: WorkerKind,
    },
    /// The last stage finished and the job is completed.
    JobCompleted,
    /// Task state recorded, nothing else to do.
    Unchanged,
}

/// Owns job-level status and stage transitions.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    dispatcher: TaskDispatcher,
    pipeline: Arc<Pipeline>,
    save_conflict_retries: u32,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        channel: Arc<dyn MessageChannel>,
        pipeline: Arc<Pipeline>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            dispatcher: TaskDispatcher::new(channel),
            pipeline,
            save_conflict_retries: config.save_conflict_retries,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Create a job with one pending task for the first stage, persist it,
    /// then dispatch that task.
    pub async fn create_job(&self, request: CreateJobRequest) -> OrchestratorResult<Job> {
        let media_id = required(request.media_id, "mediaId")?;
        let source_url = required(request.source_url, "sourceUrl")?;

        let job = Job::new(media_id, source_url, self.pipeline.first().worker_kind);
        let job = self.store.save(job).await?;

        metrics::record_job_created();
        info!(job_id = %job.id, media_id = %job.media_id, "Created job");

        if let Some(task) = job.tasks.first() {
            self.dispatch(&job, task).await?;
        }
        Ok(job)
    }

    /// Most recent job for a media item.
    pub async fn get_job(&self, media_id: &str) -> OrchestratorResult<Job> {
        self.store
            .get_job_by_media_id(media_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("No job for media {}", media_id)))
    }

    /// Record a finished task and move the job to its next stage.
    ///
    /// The next stage is dispatched while its task is still pending. A
    /// redelivered completion re-publishes a pending next task (its first
    /// publish may never have happened) and dispatches nothing once that
    /// task is running or finished.
    pub async fn handle_task_completed(
        &self,
        event: TaskCompletedEvent,
    ) -> OrchestratorResult<Advance> {
        let TaskCompletedEvent {
            job_id,
            task_id,
            task_type,
            output,
        } = event;

        if output.worker_kind() != task_type {
            return Err(OrchestratorError::rejected(format!(
                "{} output reported for {} task {}",
                output.worker_kind(),
                task_type,
                task_id
            )));
        }
        if !self.pipeline.contains(task_type) {
            return Err(OrchestratorError::rejected(format!(
                "{} is not a stage of this pipeline",
                task_type
            )));
        }

        let job = self.load(&job_id).await?;
        let task = job.task(&task_id).ok_or_else(|| {
            OrchestratorError::rejected(format!("task {} not in job {}", task_id, job_id))
        })?;
        if task.worker_kind != task_type {
            return Err(OrchestratorError::rejected(format!(
                "task {} runs {}, not {}",
                task_id, task.worker_kind, task_type
            )));
        }

        match task.status {
            TaskStatus::Failed => {
                warn!(
                    job_id = %job_id,
                    task_id = %task_id,
                    "Ignoring completion for a failed task"
                );
                return Ok(Advance::Unchanged);
            }
            TaskStatus::Pending => {
                self.store
                    .update_task_status(&job_id, &task_id, TaskStatus::Running, None)
                    .await?;
            }
            TaskStatus::Running | TaskStatus::Completed => {}
        }
        let first_delivery = task.status != TaskStatus::Completed;

        self.store
            .update_task_output(&job_id, &task_id, output)
            .await?;
        let job = self
            .store
            .update_task_status(&job_id, &task_id, TaskStatus::Completed, Some(100))
            .await?;

        if first_delivery {
            metrics::record_task_completed(task_type);
            info!(
                job_id = %job_id,
                task_id = %task_id,
                worker_kind = %task_type,
                "Task completed"
            );
        }

        if job.is_terminal() {
            info!(
                job_id = %job_id,
                status = %job.status,
                "Job is terminal, not advancing"
            );
            return Ok(Advance::Unchanged);
        }

        match self.pipeline.next_stage(task_type) {
            Some(next) => self.advance_to(&job_id, next.worker_kind).await,
            None => self.complete_job(&job_id).await,
        }
    }

    /// Mark the job failed with the failed task's message. Nothing is
    /// dispatched; the job stays retryable.
    pub async fn handle_task_failed(&self, event: TaskFailedEvent) -> OrchestratorResult<Job> {
        let TaskFailedEvent {
            job_id,
            task_id,
            error,
        } = event;

        let job = self.load(&job_id).await?;
        let task = job.task(&task_id).ok_or_else(|| {
            OrchestratorError::rejected(format!("task {} not in job {}", task_id, job_id))
        })?;
        let kind = task.worker_kind;

        let job = match task.status {
            TaskStatus::Completed => {
                warn!(
                    job_id = %job_id,
                    task_id = %task_id,
                    "Ignoring failure for a completed task"
                );
                return Ok(job);
            }
            TaskStatus::Failed => job,
            TaskStatus::Pending | TaskStatus::Running => {
                let message = error.as_deref().unwrap_or(DEFAULT_FAILURE_MESSAGE);
                self.store.fail_task(&job_id, &task_id, message).await?
            }
        };

        let message = job
            .task(&task_id)
            .and_then(|t| t.error_message.clone())
            .or(error)
            .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string());

        let (job, changed) = self
            .update_job(&job_id, "fail_job", |job| {
                let unchanged = job.status == JobStatus::Completed
                    || (job.status == JobStatus::Failed
                        && job.error.as_deref() == Some(message.as_str()));
                if unchanged {
                    return None;
                }
                job.mark_failed(message.clone());
                Some(())
            })
            .await?;

        if changed.is_some() {
            metrics::record_task_failed(kind);
            metrics::record_job_failed(kind);
            warn!(
                job_id = %job_id,
                task_id = %task_id,
                worker_kind = %kind,
                error = %message,
                "Job failed"
            );
        }
        Ok(job)
    }

    /// Reset a failed job's failed tasks and re-dispatch from the earliest
    /// pending stage. Any other status is left untouched.
    pub async fn retry_job(&self, media_id: &str) -> OrchestratorResult<Job> {
        let job = self.get_job(media_id).await?;
        if job.status != JobStatus::Failed {
            info!(
                job_id = %job.id,
                status = %job.status,
                "Job is not failed, nothing to retry"
            );
            return Ok(job);
        }

        let pipeline = &self.pipeline;
        let (job, reset) = self
            .update_job(&job.id, "retry_job", |job| {
                if job.status != JobStatus::Failed {
                    return None;
                }
                let reset = job.reset_for_retry();
                resume(job, pipeline);
                Some(reset)
            })
            .await?;

        let Some(reset) = reset else {
            info!(job_id = %job.id, "Job changed before retry, nothing to do");
            return Ok(job);
        };

        metrics::record_job_retried();
        info!(job_id = %job.id, reset_tasks = reset, "Retrying job");

        match job.earliest_pending_task(&self.pipeline) {
            Some(task) => self.dispatch(&job, task).await?,
            None if job.status == JobStatus::Completed => {
                metrics::record_job_completed();
                info!(job_id = %job.id, "Every stage already completed, job completed");
            }
            None => warn!(job_id = %job.id, "Retried job has no pending task"),
        }
        Ok(job)
    }

    async fn advance_to(&self, job_id: &JobId, next: WorkerKind) -> OrchestratorResult<Advance> {
        let (job, appended) = self
            .update_job(job_id, "advance", |job| {
                if job.is_terminal() {
                    return None;
                }
                job.append_task(next).map(|task| task.id.clone())
            })
            .await?;

        if let Some(task_id) = appended {
            let task = job
                .task(&task_id)
                .ok_or_else(|| StoreError::task_not_found(job_id, &task_id))?;
            self.dispatch(&job, task).await?;
            return Ok(Advance::Dispatched {
                task_id,
                worker_kind: next,
            });
        }

        let pending = job
            .task_for_kind(next)
            .filter(|t| t.status == TaskStatus::Pending && !job.is_terminal());
        let Some(task) = pending else {
            debug!(
                job_id = %job_id,
                worker_kind = %next,
                "Next task already picked up, not dispatching again"
            );
            return Ok(Advance::Unchanged);
        };

        info!(
            job_id = %job_id,
            task_id = %task.id,
            worker_kind = %next,
            "Next task still pending, publishing it again"
        );
        self.dispatch(&job, task).await?;
        Ok(Advance::Redispatched {
            task_id: task.id.clone(),
            worker_kind: next,
        })
    }

    async fn complete_job(&self, job_id: &JobId) -> OrchestratorResult<Advance> {
        let pipeline = &self.pipeline;
        let (job, completed) = self
            .update_job(job_id, "complete_job", |job| {
                if job.is_terminal() || !job.all_stages_completed(pipeline) {
                    return None;
                }
                let output_url = job_output_url(job);
                job.mark_completed(output_url);
                Some(())
            })
            .await?;

        if completed.is_none() {
            if !job.is_terminal() {
                warn!(job_id = %job_id, "Last stage finished with earlier stages incomplete");
            }
            return Ok(Advance::Unchanged);
        }

        metrics::record_job_completed();
        info!(
            job_id = %job_id,
            output_url = job.output_url.as_deref().unwrap_or(""),
            "Job completed"
        );
        Ok(Advance::JobCompleted)
    }

    /// Publish a task's message. A job whose task cannot be published is
    /// marked failed so that a retry picks the task up again.
    async fn dispatch(&self, job: &Job, task: &Task) -> OrchestratorResult<()> {
        let message = build_task_message(job, task);
        let Err(e) = self.dispatcher.dispatch(task, message).await else {
            return Ok(());
        };

        metrics::record_dispatch_failure(task.worker_kind);
        error!(
            job_id = %job.id,
            task_id = %task.id,
            worker_kind = %task.worker_kind,
            "Dispatch failed: {}",
            e
        );

        let reason = format!("Failed to dispatch {} task: {}", task.worker_kind, e);
        if let Err(save_err) = self
            .update_job(&job.id, "dispatch_failed", |job| {
                if job.is_terminal() {
                    return None;
                }
                job.mark_failed(reason.clone());
                Some(())
            })
            .await
        {
            error!(job_id = %job.id, "Could not record dispatch failure: {}", save_err);
        }
        Err(e.into())
    }

    async fn load(&self, job_id: &JobId) -> OrchestratorResult<Job> {
        self.store
            .get_job_by_id(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("Job {}", job_id)))
    }

    /// Read the job, apply `apply`, and save it under the read revision.
    ///
    /// `apply` returning `None` means nothing to write. A save that loses to
    /// a concurrent write is re-read and re-applied, up to the configured
    /// number of retries. Returns the latest job and what `apply` returned.
    async fn update_job<T, F>(
        &self,
        job_id: &JobId,
        operation: &'static str,
        mut apply: F,
    ) -> OrchestratorResult<(Job, Option<T>)>
    where
        F: FnMut(&mut Job) -> Option<T> + Send,
        T: Send,
    {
        let mut retries = 0;
        loop {
            let mut job = self.load(job_id).await?;
            let Some(value) = apply(&mut job) else {
                return Ok((job, None));
            };

            match self.store.save(job).await {
                Ok(saved) => return Ok((saved, Some(value))),
                Err(e) if e.is_conflict() && retries < self.save_conflict_retries => {
                    retries += 1;
                    metrics::record_save_conflict(operation);
                    debug!(
                        job_id = %job_id,
                        operation,
                        attempt = retries,
                        "Job changed concurrently, re-applying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn required(value: Option<String>, field: &str) -> OrchestratorResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(OrchestratorError::invalid_argument(format!(
            "{} is required",
            field
        ))),
    }
}

/// Result URL of a finished job: the transcoded media, else the thumbnail.
fn job_output_url(job: &Job) -> Option<String> {
    job.completed_outputs()
        .find(|o| matches!(o, TaskOutput::Transcode(_)))
        .or_else(|| job.completed_outputs().find(|o| o.primary_url().is_some()))
        .and_then(TaskOutput::primary_url)
        .map(str::to_string)
}

/// After a reset, make sure the job has somewhere to resume from: append the
/// first stage that never got a task, or complete a job whose stages all
/// finished.
fn resume(job: &mut Job, pipeline: &Pipeline) {
    if job.earliest_pending_task(pipeline).is_some() {
        return;
    }
    match pipeline.kinds().find(|kind| job.task_for_kind(*kind).is_none()) {
        Some(kind) => {
            job.append_task(kind);
        }
        None if job.all_stages_completed(pipeline) => {
            let output_url = job_output_url(job);
            job.mark_completed(output_url);
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mflow_models::{ThumbnailOutput, TranscodeOutput};

    fn complete(job: &mut Job, kind: WorkerKind, output: TaskOutput) {
        job.append_task(kind);
        let now = Utc::now();
        let task = job.tasks.iter_mut().find(|t| t.worker_kind == kind).unwrap();
        task.apply_status(TaskStatus::Running, None, now).unwrap();
        task.record_output(output);
        task.apply_status(TaskStatus::Completed, None, now).unwrap();
    }

    fn thumbnail() -> TaskOutput {
        TaskOutput::Thumbnail(ThumbnailOutput {
            thumbnail_url: "s3://out/thumb.jpg".into(),
            width: None,
            height: None,
        })
    }

    #[test]
    fn test_required_rejects_blank() {
        assert!(required(Some("m1".into()), "mediaId").is_ok());
        assert!(matches!(
            required(Some("  ".into()), "mediaId"),
            Err(OrchestratorError::InvalidArgument(_))
        ));
        assert!(required(None, "sourceUrl").is_err());
    }

    #[test]
    fn test_output_url_prefers_transcode() {
        let mut job = Job::new("m1", "s3://m1.mp4", WorkerKind::Thumbnail);
        complete(&mut job, WorkerKind::Thumbnail, thumbnail());
        assert_eq!(job_output_url(&job).as_deref(), Some("s3://out/thumb.jpg"));

        complete(
            &mut job,
            WorkerKind::Transcode,
            TaskOutput::Transcode(TranscodeOutput {
                output_url: "s3://out/1080.mp4".into(),
                renditions: vec![],
            }),
        );
        assert_eq!(job_output_url(&job).as_deref(), Some("s3://out/1080.mp4"));
    }

    #[test]
    fn test_resume_appends_missing_stage() {
        let pipeline = Pipeline::from_kinds([WorkerKind::Thumbnail, WorkerKind::Transcode]).unwrap();
        let mut job = Job::new("m1", "s3://m1.mp4", WorkerKind::Thumbnail);
        complete(&mut job, WorkerKind::Thumbnail, thumbnail());

        resume(&mut job, &pipeline);

        assert_eq!(job.tasks.len(), 2);
        assert_eq!(job.tasks[1].worker_kind, WorkerKind::Transcode);
        assert_eq!(job.tasks[1].status, TaskStatus::Pending);
    }

    #[test]
    fn test_resume_completes_finished_job() {
        let pipeline = Pipeline::from_kinds([WorkerKind::Thumbnail]).unwrap();
        let mut job = Job::new("m1", "s3://m1.mp4", WorkerKind::Thumbnail);
        complete(&mut job, WorkerKind::Thumbnail, thumbnail());
        job.mark_failed("dispatch failed");

        resume(&mut job, &pipeline);

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output_url.as_deref(), Some("s3://out/thumb.jpg"));
    }
}
