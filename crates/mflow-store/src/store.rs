//! The job store contract.

use async_trait::async_trait;

use mflow_models::{Job, JobId, TaskId, TaskOutput, TaskStatus};

use crate::error::StoreResult;

/// Sole persistence mutator for jobs and their embedded tasks.
///
/// Task-scoped methods write only the addressed task's fields (plus the
/// job's `updatedAt`), so concurrent writers never clobber unrelated tasks.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job (`revision == None`) or replace it whole.
    ///
    /// Replacement is guarded by the revision read with the job; a stale
    /// revision fails with [`StoreError::Conflict`](crate::StoreError::Conflict).
    /// Returns the job carrying its new revision.
    async fn save(&self, job: Job) -> StoreResult<Job>;

    async fn get_job_by_id(&self, id: &JobId) -> StoreResult<Option<Job>>;

    /// Most recently created job for a media item.
    async fn get_job_by_media_id(&self, media_id: &str) -> StoreResult<Option<Job>>;

    /// Apply a status write to one task, following the task transition
    /// table. Progress never decreases while running; re-marking a completed
    /// task completed changes nothing.
    async fn update_task_status(
        &self,
        job_id: &JobId,
        task_id: &TaskId,
        status: TaskStatus,
        progress: Option<u8>,
    ) -> StoreResult<Job>;

    /// Record a task's output. Ignored once the task is completed.
    async fn update_task_output(
        &self,
        job_id: &JobId,
        task_id: &TaskId,
        output: TaskOutput,
    ) -> StoreResult<Job>;

    /// Mark a task failed with a message. Ignored once the task is completed.
    async fn fail_task(&self, job_id: &JobId, task_id: &TaskId, message: &str)
        -> StoreResult<Job>;

    /// Jobs that are neither completed nor failed, up to `limit`.
    async fn list_active_jobs(&self, limit: usize) -> StoreResult<Vec<Job>>;

    /// Connectivity check.
    async fn ping(&self) -> StoreResult<()>;
}
