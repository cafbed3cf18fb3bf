//! In-memory job store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use mflow_models::{Job, JobId, Task, TaskId, TaskOutput, TaskStatus};

use crate::error::{StoreError, StoreResult};
use crate::store::JobStore;

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    next_revision: u64,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_revision += 1;
        self.next_revision.to_string()
    }
}

/// Job store held in process memory, with the same revision semantics as
/// the Firestore backend.
#[derive(Default)]
pub struct InMemoryJobStore {
    state: RwLock<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs.
    pub async fn len(&self) -> usize {
        self.state.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn modify_task<F>(&self, job_id: &JobId, task_id: &TaskId, f: F) -> StoreResult<Job>
    where
        F: FnOnce(&mut Task) -> StoreResult<bool> + Send,
    {
        let mut state = self.state.write().await;
        let revision = state.bump();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::job_not_found(job_id))?;
        let task = job
            .task_mut(task_id)
            .ok_or_else(|| StoreError::task_not_found(job_id, task_id))?;

        if f(task)? {
            job.updated_at = Utc::now();
            job.revision = Some(revision);
        }
        Ok(job.clone())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save(&self, mut job: Job) -> StoreResult<Job> {
        let mut state = self.state.write().await;
        let stored_revision = state.jobs.get(&job.id).and_then(|j| j.revision.clone());

        match (&job.revision, stored_revision) {
            (None, Some(_)) => return Err(StoreError::AlreadyExists(job.id.to_string())),
            (Some(_), None) => return Err(StoreError::job_not_found(&job.id)),
            (Some(expected), Some(actual)) if *expected != actual => {
                return Err(StoreError::Conflict(job.id.to_string()));
            }
            _ => {}
        }

        job.revision = Some(state.bump());
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get_job_by_id(&self, id: &JobId) -> StoreResult<Option<Job>> {
        Ok(self.state.read().await.jobs.get(id).cloned())
    }

    async fn get_job_by_media_id(&self, media_id: &str) -> StoreResult<Option<Job>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.media_id == media_id)
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn update_task_status(
        &self,
        job_id: &JobId,
        task_id: &TaskId,
        status: TaskStatus,
        progress: Option<u8>,
    ) -> StoreResult<Job> {
        self.modify_task(job_id, task_id, |task| {
            Ok(task.apply_status(status, progress, Utc::now())?)
        })
        .await
    }

    async fn update_task_output(
        &self,
        job_id: &JobId,
        task_id: &TaskId,
        output: TaskOutput,
    ) -> StoreResult<Job> {
        self.modify_task(job_id, task_id, |task| Ok(task.record_output(output)))
            .await
    }

    async fn fail_task(
        &self,
        job_id: &JobId,
        task_id: &TaskId,
        message: &str,
    ) -> StoreResult<Job> {
        self.modify_task(job_id, task_id, |task| {
            Ok(task.record_failure(message, Utc::now()))
        })
        .await
    }

    async fn list_active_jobs(&self, limit: usize) -> StoreResult<Vec<Job>> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| !j.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
