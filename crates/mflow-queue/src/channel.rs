//! Channel names and the broker abstraction.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;

use mflow_models::WorkerKind;

use crate::error::{QueueError, QueueResult};
use crate::message::{QueueMessage, TaskCompletedEvent, TaskFailedEvent, TaskMessage};

/// A named channel on the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Dispatch channel for one worker kind (`<kind>_tasks`)
    Tasks(WorkerKind),
    /// Shared completion events (`task_completed`)
    TaskCompleted,
    /// Shared failure events (`task_failed`)
    TaskFailed,
}

impl Channel {
    pub fn name(&self) -> &'static str {
        match self {
            Channel::Tasks(kind) => kind.channel_name(),
            Channel::TaskCompleted => "task_completed",
            Channel::TaskFailed => "task_failed",
        }
    }

    /// Whether `message` has the schema bound to this channel.
    pub fn accepts(&self, message: &QueueMessage) -> bool {
        matches!(
            (self, message),
            (Channel::Tasks(_), QueueMessage::Task(_))
                | (Channel::TaskCompleted, QueueMessage::TaskCompleted(_))
                | (Channel::TaskFailed, QueueMessage::TaskFailed(_))
        )
    }

    pub(crate) fn ensure_accepts(&self, message: &QueueMessage) -> QueueResult<()> {
        if self.accepts(message) {
            Ok(())
        } else {
            Err(QueueError::ChannelMismatch {
                channel: self.name().to_string(),
                found: message.type_name(),
            })
        }
    }

    /// Decode a raw body with this channel's schema.
    pub fn decode(&self, body: &str) -> QueueResult<QueueMessage> {
        let parsed = match self {
            Channel::Tasks(_) => serde_json::from_str::<TaskMessage>(body).map(QueueMessage::Task),
            Channel::TaskCompleted => {
                serde_json::from_str::<TaskCompletedEvent>(body).map(QueueMessage::TaskCompleted)
            }
            Channel::TaskFailed => {
                serde_json::from_str::<TaskFailedEvent>(body).map(QueueMessage::TaskFailed)
            }
        };
        parsed.map_err(|e| QueueError::malformed(format!("{} body: {}", self.name(), e)))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Channel {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_completed" => Ok(Channel::TaskCompleted),
            "task_failed" => Ok(Channel::TaskFailed),
            other => other
                .strip_suffix("_tasks")
                .and_then(|kind| kind.parse::<WorkerKind>().ok())
                .map(Channel::Tasks)
                .ok_or_else(|| QueueError::malformed(format!("unknown channel: {other}"))),
        }
    }
}

/// A message received from a channel, pending ack or nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned message ID
    pub id: String,
    pub channel: Channel,
    /// Raw JSON body
    pub body: String,
}

impl Delivery {
    /// Decode the body with the schema of the channel it arrived on.
    pub fn decode(&self) -> QueueResult<QueueMessage> {
        self.channel.decode(&self.body)
    }

    /// Decode as a dispatch message and validate its envelope.
    pub fn task_message(&self) -> QueueResult<TaskMessage> {
        match self.decode()? {
            QueueMessage::Task(msg) => {
                msg.validate()?;
                Ok(msg)
            }
            other => Err(QueueError::malformed(format!(
                "expected task message, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Typed publish/consume over a durable broker with explicit ack/nack.
///
/// Delivery is at-least-once: a consumer acks only after its side effects
/// are applied.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Prepare broker-side structures (streams, consumer groups).
    async fn init(&self, channel: Channel) -> QueueResult<()>;

    /// Publish a message, returning the broker message ID.
    async fn publish(&self, channel: Channel, message: &QueueMessage) -> QueueResult<String>;

    /// Receive up to `max` new deliveries, waiting at most `block`.
    async fn receive(
        &self,
        channel: Channel,
        consumer: &str,
        max: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>>;

    /// Take over deliveries that another consumer (or an earlier run of
    /// this one) received but never settled, once they have been idle for
    /// at least `min_idle`.
    async fn claim_pending(
        &self,
        channel: Channel,
        consumer: &str,
        min_idle: Duration,
        max: usize,
    ) -> QueueResult<Vec<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Reject a delivery. Without requeue the body goes to the channel's
    /// dead-letter stream.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> QueueResult<()>;

    /// Connectivity check.
    async fn ping(&self) -> QueueResult<()>;
}
