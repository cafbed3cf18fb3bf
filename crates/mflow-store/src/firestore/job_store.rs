//! `JobStore` over Firestore.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use mflow_models::{Job, JobId, JobStatus, Task, TaskId, TaskOutput, TaskStatus};

use super::client::FirestoreClient;
use super::convert::{
    job_from_document, job_to_fields, task_field_path, task_to_value, TASKS_FIELD,
    UPDATED_AT_FIELD,
};
use super::error::FirestoreError;
use super::metrics::record_conflict;
use super::types::{ArrayValue, StructuredQuery, ToFirestoreValue, Value};
use crate::error::{StoreError, StoreResult};
use crate::store::JobStore;

/// Attempts for a task-scoped write that keeps losing the precondition race.
const TASK_WRITE_ATTEMPTS: u32 = 5;

/// Job store backed by a Firestore collection.
///
/// Every write carries the document's last update time as a precondition,
/// so a whole-job `save` never silently overwrites a concurrent task update.
#[derive(Clone)]
pub struct FirestoreJobStore {
    client: FirestoreClient,
    collection: String,
}

impl FirestoreJobStore {
    pub fn new(client: FirestoreClient) -> Self {
        let collection = client.config().jobs_collection.clone();
        Self { client, collection }
    }

    /// Create from environment variables.
    pub async fn from_env() -> StoreResult<Self> {
        Ok(Self::new(FirestoreClient::from_env().await?))
    }

    async fn load(&self, id: &JobId) -> StoreResult<Option<Job>> {
        self.client
            .get_document(&self.collection, id.as_str())
            .await?
            .map(|doc| job_from_document(&doc))
            .transpose()
    }

    /// Read-modify-write of one task entry, retried on precondition failure.
    async fn modify_task<F>(
        &self,
        operation: &'static str,
        job_id: &JobId,
        task_id: &TaskId,
        f: F,
    ) -> StoreResult<Job>
    where
        F: Fn(&mut Task) -> StoreResult<bool> + Send + Sync,
    {
        for attempt in 1..=TASK_WRITE_ATTEMPTS {
            let mut job = self
                .load(job_id)
                .await?
                .ok_or_else(|| StoreError::job_not_found(job_id))?;
            let position = job
                .tasks
                .iter()
                .position(|t| &t.id == task_id)
                .ok_or_else(|| StoreError::task_not_found(job_id, task_id))?;

            if !f(&mut job.tasks[position])? {
                return Ok(job);
            }

            let now = Utc::now();
            job.updated_at = now;

            let mut entry = HashMap::new();
            entry.insert(
                task_id.to_string(),
                task_to_value(&job.tasks[position], position)?,
            );
            let mut fields = HashMap::new();
            fields.insert(TASKS_FIELD.to_string(), Value::map(entry));
            fields.insert(UPDATED_AT_FIELD.to_string(), now.to_firestore_value());
            let mask = [task_field_path(task_id.as_str()), UPDATED_AT_FIELD.to_string()];

            match self
                .client
                .patch_document(
                    &self.collection,
                    job_id.as_str(),
                    fields,
                    Some(&mask),
                    job.revision.as_deref(),
                )
                .await
            {
                Ok(doc) => {
                    job.revision = doc.update_time;
                    return Ok(job);
                }
                Err(e) if e.is_precondition_failed() => {
                    record_conflict(operation);
                    debug!(
                        job_id = %job_id,
                        task_id = %task_id,
                        attempt,
                        "Task write lost a concurrent update, re-reading"
                    );
                }
                Err(FirestoreError::NotFound(_)) => return Err(StoreError::job_not_found(job_id)),
                Err(e) => return Err(e.into()),
            }
        }

        warn!(job_id = %job_id, task_id = %task_id, operation, "Task write kept conflicting");
        Err(StoreError::Conflict(job_id.to_string()))
    }
}

#[async_trait]
impl JobStore for FirestoreJobStore {
    async fn save(&self, mut job: Job) -> StoreResult<Job> {
        let fields = job_to_fields(&job)?;
        let id = job.id.to_string();

        let doc = match job.revision.as_deref() {
            None => self
                .client
                .create_document(&self.collection, &id, fields)
                .await
                .map_err(|e| match e {
                    FirestoreError::AlreadyExists(_) => StoreError::AlreadyExists(id.clone()),
                    e => e.into(),
                })?,
            Some(revision) => self
                .client
                .patch_document(&self.collection, &id, fields, None, Some(revision))
                .await
                .map_err(|e| {
                    if e.is_precondition_failed() {
                        record_conflict("save");
                        StoreError::Conflict(id.clone())
                    } else if matches!(e, FirestoreError::NotFound(_)) {
                        StoreError::job_not_found(&id)
                    } else {
                        e.into()
                    }
                })?,
        };

        job.revision = doc.update_time;
        Ok(job)
    }

    async fn get_job_by_id(&self, id: &JobId) -> StoreResult<Option<Job>> {
        self.load(id).await
    }

    async fn get_job_by_media_id(&self, media_id: &str) -> StoreResult<Option<Job>> {
        // No limit: without an orderBy it could cut off the newest job
        let query = StructuredQuery::collection(&self.collection).filter(
            "mediaId",
            "EQUAL",
            media_id.to_firestore_value(),
        );

        let docs = self.client.run_query(query).await?;
        let jobs = docs
            .iter()
            .map(job_from_document)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(jobs.into_iter().max_by_key(|j| j.created_at))
    }

    async fn update_task_status(
        &self,
        job_id: &JobId,
        task_id: &TaskId,
        status: TaskStatus,
        progress: Option<u8>,
    ) -> StoreResult<Job> {
        self.modify_task("update_task_status", job_id, task_id, |task| {
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
        self.modify_task("update_task_output", job_id, task_id, |task| {
            Ok(task.record_output(output.clone()))
        })
        .await
    }

    async fn fail_task(
        &self,
        job_id: &JobId,
        task_id: &TaskId,
        message: &str,
    ) -> StoreResult<Job> {
        self.modify_task("fail_task", job_id, task_id, |task| {
            Ok(task.record_failure(message, Utc::now()))
        })
        .await
    }

    async fn list_active_jobs(&self, limit: usize) -> StoreResult<Vec<Job>> {
        let active = Value::ArrayValue(ArrayValue {
            values: Some(vec![
                JobStatus::Pending.as_str().to_firestore_value(),
                JobStatus::Running.as_str().to_firestore_value(),
            ]),
        });
        let query = StructuredQuery::collection(&self.collection)
            .filter("status", "IN", active)
            .limit(limit);

        self.client
            .run_query(query)
            .await?
            .iter()
            .map(job_from_document)
            .collect()
    }

    async fn ping(&self) -> StoreResult<()> {
        self.client
            .get_document(&self.collection, "_healthcheck")
            .await?;
        Ok(())
    }
}
