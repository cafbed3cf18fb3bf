//! Wire messages carried on each channel.
//!
//! Bodies are plain camelCase JSON objects. The channel a body travels on
//! selects its schema, so decoding always goes through [`Channel`].

use serde::{Deserialize, Serialize};

use mflow_models::{JobId, StagePayload, TaskId, TaskOutput, WorkerKind};

use crate::error::{QueueError, QueueResult};

/// Dispatch message on `<kind>_tasks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<StagePayload>,
}

impl TaskMessage {
    pub fn new(job_id: JobId, task_id: TaskId, source_url: impl Into<String>) -> Self {
        Self {
            job_id,
            task_id,
            source_url: source_url.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: StagePayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Check the envelope fields a worker needs before touching any state.
    pub fn validate(&self) -> QueueResult<()> {
        if self.job_id.as_str().trim().is_empty() {
            return Err(QueueError::malformed("jobId is empty"));
        }
        if self.task_id.as_str().trim().is_empty() {
            return Err(QueueError::malformed("taskId is empty"));
        }
        if self.source_url.trim().is_empty() {
            return Err(QueueError::malformed("sourceUrl is empty"));
        }
        Ok(())
    }
}

/// Completion event on `task_completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletedEvent {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub task_type: WorkerKind,
    pub output: TaskOutput,
}

/// Failure event on `task_failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailedEvent {
    pub job_id: JobId,
    pub task_id: TaskId,
    /// Worker-side failure message, also persisted on the task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Any message that can travel on a channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueueMessage {
    Task(TaskMessage),
    TaskCompleted(TaskCompletedEvent),
    TaskFailed(TaskFailedEvent),
}

impl QueueMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            QueueMessage::Task(_) => "task",
            QueueMessage::TaskCompleted(_) => "task_completed",
            QueueMessage::TaskFailed(_) => "task_failed",
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            QueueMessage::Task(m) => &m.job_id,
            QueueMessage::TaskCompleted(m) => &m.job_id,
            QueueMessage::TaskFailed(m) => &m.job_id,
        }
    }

    pub fn to_body(&self) -> QueueResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<TaskMessage> for QueueMessage {
    fn from(m: TaskMessage) -> Self {
        QueueMessage::Task(m)
    }
}

impl From<TaskCompletedEvent> for QueueMessage {
    fn from(m: TaskCompletedEvent) -> Self {
        QueueMessage::TaskCompleted(m)
    }
}

impl From<TaskFailedEvent> for QueueMessage {
    fn from(m: TaskFailedEvent) -> Self {
        QueueMessage::TaskFailed(m)
    }
}
