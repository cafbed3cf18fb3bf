//! Orchestrator error types.

use thiserror::Error;

use mflow_queue::QueueError;
use mflow_store::StoreError;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// An event that cannot apply to the job it names.
    #[error("Rejected event: {0}")]
    RejectedEvent(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl OrchestratorError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::RejectedEvent(msg.into())
    }

    /// Redelivering the same message can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::NotFound(_) | Self::RejectedEvent(_)
        ) || matches!(self, Self::Store(e) if e.is_not_found())
            || matches!(self, Self::Queue(e) if e.is_malformed())
    }

    /// Lost the optimistic-concurrency race too many times.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_errors() {
        assert!(OrchestratorError::not_found("job j1").is_permanent());
        assert!(OrchestratorError::from(StoreError::task_not_found("j1", "t1")).is_permanent());
        assert!(!OrchestratorError::from(StoreError::Conflict("j1".into())).is_permanent());
        assert!(OrchestratorError::from(StoreError::Conflict("j1".into())).is_conflict());
    }
}
