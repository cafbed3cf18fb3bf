//! Job handlers: create, retry, inspect.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use validator::Validate;

use mflow_models::{
    CreateJobRequest, CreateJobResponse, Job, JobId, JobStatus, Task, TaskId, TaskOutput,
    TaskStatus, WorkerKind,
};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Body of a successful retry.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryJobResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// One task in a job view.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub task_id: TaskId,
    pub worker_kind: WorkerKind,
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<TaskOutput>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            worker_kind: task.worker_kind,
            status: task.status,
            progress: task.progress,
            error: task.error_message.clone(),
            output: task.output.clone(),
        }
    }
}

/// Operator view of a job.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: JobId,
    pub media_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    pub tasks: Vec<TaskView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            media_id: job.media_id.clone(),
            status: job.status,
            error: job.error.clone(),
            output_url: job.output_url.clone(),
            tasks: job.tasks.iter().map(TaskView::from).collect(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// POST /jobs
///
/// Returns:
/// - 201: `{jobId}`; the first stage is dispatched
/// - 400: missing or empty `mediaId` / `sourceUrl`, or a malformed body
pub async fn create_job(
    State(state): State<AppState>,
    payload: Result<Json<CreateJobRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreateJobResponse>)> {
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    request.validate()?;

    let job = state.orchestrator.create_job(request).await?;
    info!(job_id = %job.id, media_id = %job.media_id, "Job accepted");

    Ok((StatusCode::CREATED, Json(CreateJobResponse { job_id: job.id })))
}

/// POST /jobs/:media_id/retry
///
/// Re-dispatches a failed job from its earliest pending stage. A job in any
/// other state is returned unchanged.
pub async fn retry_job(
    State(state): State<AppState>,
    Path(media_id): Path<String>,
) -> ApiResult<Json<RetryJobResponse>> {
    let job = state.orchestrator.retry_job(&media_id).await?;
    Ok(Json(RetryJobResponse {
        job_id: job.id,
        status: job.status,
    }))
}

/// GET /jobs/:media_id
pub async fn get_job(
    State(state): State<AppState>,
    Path(media_id): Path<String>,
) -> ApiResult<Json<JobView>> {
    let job = state.orchestrator.get_job(&media_id).await?;
    Ok(Json(JobView::from(&job)))
}
