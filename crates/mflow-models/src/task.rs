//! Per-stage task records embedded in a job.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::{TaskOutput, WorkerKind};

/// Identifier of a task, stable across retries of the same stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dispatch or for a worker to pick it up
    #[default]
    Pending,
    /// A worker is processing it
    Running,
    /// Output recorded
    Completed,
    /// Processing failed; kept until a retry resets it
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether a status write from `self` to `next` is allowed.
    ///
    /// Terminal-to-same writes are accepted as no-ops. Leaving `failed`
    /// only happens through [`Task::reset`].
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Completed, Completed)
                | (Failed, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Rejected task status write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid task transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// One pipeline stage's execution record within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Stable task ID
    pub id: TaskId,

    /// Stage this task runs
    pub worker_kind: WorkerKind,

    /// Current state
    #[serde(default)]
    pub status: TaskStatus,

    /// Progress (0-100)
    #[serde(default)]
    pub progress: u8,

    /// Stage output, set on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<TaskOutput>,

    /// Failure message, cleared by retry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task for a stage.
    pub fn new(worker_kind: WorkerKind) -> Self {
        Self {
            id: TaskId::new(),
            worker_kind,
            status: TaskStatus::Pending,
            progress: 0,
            output: None,
            error_message: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Apply a status write.
    ///
    /// Returns `Ok(false)` when the write changes nothing (e.g. re-marking a
    /// completed task). Progress never decreases while running.
    pub fn apply_status(
        &mut self,
        status: TaskStatus,
        progress: Option<u8>,
        now: DateTime<Utc>,
    ) -> Result<bool, InvalidTransition> {
        if !self.status.can_transition_to(status) {
            return Err(InvalidTransition {
                from: self.status,
                to: status,
            });
        }

        let before = (self.status, self.progress);
        match (self.status, status) {
            (TaskStatus::Completed, _) | (TaskStatus::Failed, _) => return Ok(false),
            (TaskStatus::Pending, TaskStatus::Running) => {
                self.status = TaskStatus::Running;
                self.progress = progress.unwrap_or(0).min(100);
                self.start_time = Some(now);
            }
            (_, TaskStatus::Running) => {
                if let Some(p) = progress {
                    self.progress = self.progress.max(p.min(100));
                }
            }
            (_, TaskStatus::Completed) => {
                self.status = TaskStatus::Completed;
                self.progress = 100;
                self.end_time = Some(now);
            }
            (_, TaskStatus::Failed) => {
                self.status = TaskStatus::Failed;
                self.end_time = Some(now);
            }
            (_, TaskStatus::Pending) => {}
        }

        Ok(before != (self.status, self.progress))
    }

    /// Record the stage output. Ignored once the task is completed.
    pub fn record_output(&mut self, output: TaskOutput) -> bool {
        if self.status == TaskStatus::Completed {
            return false;
        }
        self.output = Some(output);
        true
    }

    /// Mark failed with a message. Ignored once the task is completed.
    pub fn record_failure(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.status == TaskStatus::Completed {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.error_message = Some(message.into());
        self.end_time = Some(now);
        true
    }

    /// Return a failed task to pending for a retry.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.progress = 0;
        self.error_message = None;
        self.start_time = None;
        self.end_time = None;
    }
}
