//! Consumes `task_completed` and `task_failed`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use mflow_queue::{
    Channel, Consumer, ConsumerConfig, Delivery, MessageChannel, MessageHandler, Outcome,
    QueueMessage, QueueResult,
};

use crate::metrics;
use crate::orchestrator::Orchestrator;

/// Applies task events to their jobs.
///
/// Events that can never apply (malformed, unknown job or task, mismatched
/// output) are acked and dropped. A job that kept changing underneath is
/// requeued. Anything else dead-letters the event.
pub struct EventHandler {
    orchestrator: Arc<Orchestrator>,
}

impl EventHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl MessageHandler for EventHandler {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<Outcome> {
        let message = match delivery.decode() {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    channel = %delivery.channel,
                    message_id = %delivery.id,
                    "Dropping malformed event: {}",
                    e
                );
                metrics::record_event_dropped("malformed");
                return Ok(Outcome::Ack);
            }
        };

        let event = message.type_name();
        let job_id = message.job_id().clone();
        let result = match message {
            QueueMessage::TaskCompleted(e) => self
                .orchestrator
                .handle_task_completed(e)
                .await
                .map(|_| ()),
            QueueMessage::TaskFailed(e) => {
                self.orchestrator.handle_task_failed(e).await.map(|_| ())
            }
            QueueMessage::Task(_) => {
                warn!(channel = %delivery.channel, "Dropping dispatch message on an event channel");
                metrics::record_event_dropped(event);
                return Ok(Outcome::Ack);
            }
        };

        match result {
            Ok(()) => Ok(Outcome::Ack),
            Err(e) if e.is_permanent() => {
                warn!(job_id = %job_id, event, "Dropping event: {}", e);
                metrics::record_event_dropped(event);
                Ok(Outcome::Ack)
            }
            Err(e) if e.is_conflict() => {
                warn!(job_id = %job_id, event, "Requeueing event after repeated conflicts");
                Ok(Outcome::Nack { requeue: true })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// The orchestrator's consumers for both event channels.
pub struct EventConsumers {
    consumer: Arc<Consumer>,
    handles: Vec<JoinHandle<QueueResult<()>>>,
}

impl EventConsumers {
    /// Spawn one consume loop per event channel, sharing a concurrency limit.
    pub fn start(
        broker: Arc<dyn MessageChannel>,
        orchestrator: Arc<Orchestrator>,
        prefetch: usize,
    ) -> Self {
        let config = ConsumerConfig::from_env()
            .with_prefetch(prefetch)
            .with_name_prefix("orchestrator");
        let consumer = Arc::new(Consumer::new(broker, config));
        let handler: Arc<dyn MessageHandler> = Arc::new(EventHandler::new(orchestrator));

        let handles = [Channel::TaskCompleted, Channel::TaskFailed]
            .into_iter()
            .map(|channel| {
                let consumer = Arc::clone(&consumer);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { consumer.run(channel, handler).await })
            })
            .collect();

        Self { consumer, handles }
    }

    /// Stop consuming and wait for in-flight events.
    pub async fn shutdown(self) {
        self.consumer.shutdown();
        for handle in self.handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Event consumer stopped with error: {}", e),
                Err(e) => error!("Event consumer task panicked: {}", e),
            }
        }
    }
}
