//! Publishes dispatch messages to their stage channel.

use std::sync::Arc;

use tracing::info;

use mflow_models::Task;
use mflow_queue::{Channel, MessageChannel, QueueResult, TaskMessage};

use crate::metrics;

/// Routes a task's message to `<kind>_tasks`.
#[derive(Clone)]
pub struct TaskDispatcher {
    channel: Arc<dyn MessageChannel>,
}

impl TaskDispatcher {
    pub fn new(channel: Arc<dyn MessageChannel>) -> Self {
        Self { channel }
    }

    /// Publish `message` for `task`. Returns the broker message ID.
    pub async fn dispatch(&self, task: &Task, message: TaskMessage) -> QueueResult<String> {
        let channel = Channel::Tasks(task.worker_kind);
        let job_id = message.job_id.clone();
        let message_id = self.channel.publish(channel, &message.into()).await?;

        metrics::record_task_dispatched(task.worker_kind);
        info!(
            job_id = %job_id,
            task_id = %task.id,
            worker_kind = %task.worker_kind,
            message_id = %message_id,
            "Dispatched task"
        );
        Ok(message_id)
    }
}
