//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    Storage(#[from] mflow_storage::StorageError),

    #[error("Media error: {0}")]
    Media(#[from] mflow_media::MediaError),

    #[error("Store error: {0}")]
    Store(#[from] mflow_store::StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] mflow_queue::QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, WorkerError::MalformedMessage(_))
            || matches!(self, WorkerError::Queue(e) if e.is_malformed())
    }

    /// Message persisted on the failed task. FFmpeg failures carry the tail
    /// of stderr.
    pub fn task_message(&self) -> String {
        match self {
            WorkerError::Media(e) => e.task_message(),
            other => other.to_string(),
        }
    }
}
