//! In-process message channel.
//!
//! Keeps every published message and dead letter so tests can assert on
//! what a component sent.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::channel::{Channel, Delivery, MessageChannel};
use crate::error::QueueResult;
use crate::message::QueueMessage;

struct InFlight {
    delivery: Delivery,
    consumer: String,
    since: Instant,
}

#[derive(Default)]
struct State {
    next_id: u64,
    ready: HashMap<Channel, VecDeque<Delivery>>,
    in_flight: HashMap<String, InFlight>,
    published: Vec<(Channel, QueueMessage)>,
    acked: Vec<Delivery>,
    dead_letters: Vec<Delivery>,
}

impl State {
    fn enqueue(&mut self, channel: Channel, body: String) -> String {
        self.next_id += 1;
        let id = format!("{}-0", self.next_id);
        self.ready.entry(channel).or_default().push_back(Delivery {
            id: id.clone(),
            channel,
            body,
        });
        id
    }

    fn mark_in_flight(&mut self, delivery: Delivery, consumer: &str) {
        self.in_flight.insert(
            delivery.id.clone(),
            InFlight {
                delivery,
                consumer: consumer.to_string(),
                since: Instant::now(),
            },
        );
    }
}

/// Message channel held entirely in memory.
///
/// Received deliveries stay in flight until settled; unsettled ones can be
/// taken over with `claim_pending`, like entries in a stream's pending list.
#[derive(Default)]
pub struct InMemoryChannel {
    state: Mutex<State>,
    notify: Notify,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a raw body without schema checks.
    pub fn push_raw(&self, channel: Channel, body: impl Into<String>) -> String {
        let id = self.lock().enqueue(channel, body.into());
        self.notify.notify_waiters();
        id
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<(Channel, QueueMessage)> {
        self.lock().published.clone()
    }

    /// Messages published on one channel, in order.
    pub fn published_on(&self, channel: Channel) -> Vec<QueueMessage> {
        self.lock()
            .published
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn published_count(&self) -> usize {
        self.lock().published.len()
    }

    /// Forget recorded publishes (queued deliveries are kept).
    pub fn clear_published(&self) {
        self.lock().published.clear();
    }

    pub fn acked(&self) -> Vec<Delivery> {
        self.lock().acked.clone()
    }

    pub fn dead_letters(&self) -> Vec<Delivery> {
        self.lock().dead_letters.clone()
    }

    /// Deliveries waiting to be received on a channel.
    pub fn ready_len(&self, channel: Channel) -> usize {
        self.lock().ready.get(&channel).map_or(0, VecDeque::len)
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Take the next waiting delivery on a channel, marking it in flight.
    pub fn take(&self, channel: Channel) -> Option<Delivery> {
        self.take_as(channel, "test")
    }

    /// Like `take`, recording which consumer holds the delivery.
    pub fn take_as(&self, channel: Channel, consumer: &str) -> Option<Delivery> {
        let mut state = self.lock();
        let delivery = state.ready.get_mut(&channel)?.pop_front()?;
        state.mark_in_flight(delivery.clone(), consumer);
        Some(delivery)
    }

    /// Consumer currently holding an in-flight delivery.
    pub fn holder(&self, id: &str) -> Option<String> {
        self.lock().in_flight.get(id).map(|f| f.consumer.clone())
    }

    fn take_up_to(&self, channel: Channel, consumer: &str, max: usize) -> Vec<Delivery> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.take_as(channel, consumer) {
                Some(d) => out.push(d),
                None => break,
            }
        }
        out
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    async fn init(&self, _channel: Channel) -> QueueResult<()> {
        Ok(())
    }

    async fn publish(&self, channel: Channel, message: &QueueMessage) -> QueueResult<String> {
        channel.ensure_accepts(message)?;
        let body = message.to_body()?;
        let id = {
            let mut state = self.lock();
            state.published.push((channel, message.clone()));
            state.enqueue(channel, body)
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn receive(
        &self,
        channel: Channel,
        consumer: &str,
        max: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>> {
        let max = max.max(1);
        let notified = self.notify.notified();
        let deliveries = self.take_up_to(channel, consumer, max);
        if !deliveries.is_empty() {
            return Ok(deliveries);
        }
        let _ = tokio::time::timeout(block, notified).await;
        Ok(self.take_up_to(channel, consumer, max))
    }

    async fn claim_pending(
        &self,
        channel: Channel,
        consumer: &str,
        min_idle: Duration,
        max: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut state = self.lock();
        let now = Instant::now();
        let mut idle: Vec<&mut InFlight> = state
            .in_flight
            .values_mut()
            .filter(|f| f.delivery.channel == channel && now.duration_since(f.since) >= min_idle)
            .collect();
        idle.sort_by(|a, b| a.since.cmp(&b.since));

        Ok(idle
            .into_iter()
            .take(max.max(1))
            .map(|f| {
                f.consumer = consumer.to_string();
                f.since = now;
                f.delivery.clone()
            })
            .collect())
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut state = self.lock();
        if let Some(f) = state.in_flight.remove(&delivery.id) {
            state.acked.push(f.delivery);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> QueueResult<()> {
        {
            let mut state = self.lock();
            let Some(InFlight { delivery: d, .. }) = state.in_flight.remove(&delivery.id) else {
                return Ok(());
            };
            if requeue {
                state.enqueue(d.channel, d.body);
            } else {
                state.dead_letters.push(d);
            }
        }
        if requeue {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{TaskFailedEvent, TaskMessage};
    use mflow_models::{JobId, TaskId, WorkerKind};

    fn task() -> QueueMessage {
        TaskMessage::new(JobId::new(), TaskId::new(), "s3://m1.mp4").into()
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let queue = InMemoryChannel::new();
        let channel = Channel::Tasks(WorkerKind::Thumbnail);
        queue.publish(channel, &task()).await.unwrap();
        queue.publish(channel, &task()).await.unwrap();

        let got = queue
            .receive(channel, "c1", 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(queue.ready_len(channel), 1);
        assert_eq!(queue.in_flight_len(), 1);

        queue.ack(&got[0]).await.unwrap();
        assert_eq!(queue.in_flight_len(), 0);
        assert_eq!(queue.acked().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_wrong_schema() {
        let queue = InMemoryChannel::new();
        let event: QueueMessage = TaskFailedEvent {
            job_id: JobId::new(),
            task_id: TaskId::new(),
            error: None,
        }
        .into();
        assert!(queue.publish(Channel::TaskCompleted, &event).await.is_err());
        assert_eq!(queue.published_count(), 0);
    }

    #[tokio::test]
    async fn test_nack_routes_to_dead_letters_or_requeues() {
        let queue = InMemoryChannel::new();
        let channel = Channel::Tasks(WorkerKind::Ai);
        queue.publish(channel, &task()).await.unwrap();

        let d = queue.take(channel).unwrap();
        queue.nack(&d, true).await.unwrap();
        assert_eq!(queue.ready_len(channel), 1);

        let d = queue.take(channel).unwrap();
        queue.nack(&d, false).await.unwrap();
        assert_eq!(queue.ready_len(channel), 0);
        assert_eq!(queue.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_unsettled_delivery_can_be_claimed() {
        let queue = InMemoryChannel::new();
        let channel = Channel::TaskCompleted;
        queue.push_raw(channel, "event");

        let got = queue
            .receive(channel, "crashed", 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(queue.holder(&got[0].id).as_deref(), Some("crashed"));

        let none = queue
            .claim_pending(channel, "fresh", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(none.is_empty());

        let claimed = queue
            .claim_pending(channel, "fresh", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(claimed, got);
        assert_eq!(queue.holder(&got[0].id).as_deref(), Some("fresh"));
        assert!(queue
            .claim_pending(Channel::TaskFailed, "fresh", Duration::ZERO, 10)
            .await
            .unwrap()
            .is_empty());

        queue.ack(&claimed[0]).await.unwrap();
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_receive_waits_for_publish() {
        let queue = std::sync::Arc::new(InMemoryChannel::new());
        let channel = Channel::Tasks(WorkerKind::Subtitle);

        let publisher = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                queue.publish(channel, &task()).await.unwrap();
            })
        };

        let got = queue
            .receive(channel, "c1", 5, Duration::from_secs(2))
            .await
            .unwrap();
        publisher.await.unwrap();
        assert_eq!(got.len(), 1);
    }
}
