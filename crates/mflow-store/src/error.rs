//! Job store error types.

use thiserror::Error;

use mflow_models::InvalidTransition;

use crate::firestore::FirestoreError;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Task {task_id} not found in job {job_id}")]
    TaskNotFound { job_id: String, task_id: String },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// The job changed since it was read; re-read and re-apply.
    #[error("Concurrent modification of job {0}")]
    Conflict(String),

    #[error("Job already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid job document: {0}")]
    InvalidDocument(String),

    #[error("Firestore error: {0}")]
    Firestore(#[from] FirestoreError),
}

impl StoreError {
    pub fn job_not_found(id: impl ToString) -> Self {
        Self::JobNotFound(id.to_string())
    }

    pub fn task_not_found(job_id: impl ToString, task_id: impl ToString) -> Self {
        Self::TaskNotFound {
            job_id: job_id.to_string(),
            task_id: task_id.to_string(),
        }
    }

    pub fn invalid_document(msg: impl Into<String>) -> Self {
        Self::InvalidDocument(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::JobNotFound(_) | Self::TaskNotFound { .. })
    }
}
