//! Bounded-concurrency consume loop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{Channel, Delivery, MessageChannel};
use crate::error::QueueResult;

/// What to do with a delivery once its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Nack { requeue: bool },
}

/// Handles one delivery at a time.
///
/// An `Err` (or a panic) is treated as `Outcome::Nack { requeue: false }`.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<Outcome>;
}

/// Consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum handlers in flight (broker prefetch)
    pub prefetch: usize,
    /// How long a receive call blocks waiting for messages
    pub block: Duration,
    /// Pause after a failed receive
    pub error_backoff: Duration,
    /// How long shutdown waits for in-flight handlers
    pub shutdown_timeout: Duration,
    /// Prefix for the broker consumer name
    pub name_prefix: String,
    /// How long a received delivery may stay unsettled before another
    /// consumer takes it over. Must exceed the longest handler run.
    pub claim_min_idle: Duration,
    /// How often to look for unsettled deliveries to take over
    pub claim_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: 4,
            block: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(60),
            name_prefix: "consumer".to_string(),
            claim_min_idle: Duration::from_secs(900),
            claim_interval: Duration::from_secs(30),
        }
    }
}

impl ConsumerConfig {
    /// Defaults overridden by `QUEUE_CLAIM_MIN_IDLE_SECS` and
    /// `QUEUE_CLAIM_INTERVAL_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
        };
        Self {
            claim_min_idle: secs("QUEUE_CLAIM_MIN_IDLE_SECS").unwrap_or(defaults.claim_min_idle),
            claim_interval: secs("QUEUE_CLAIM_INTERVAL_SECS").unwrap_or(defaults.claim_interval),
            ..defaults
        }
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }
}

/// Pulls deliveries from a channel and runs a handler for each, acking only
/// after the handler finished.
pub struct Consumer {
    broker: Arc<dyn MessageChannel>,
    config: ConsumerConfig,
    semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    name: String,
    /// Ids of deliveries whose handler is still running
    active: Arc<Mutex<HashSet<String>>>,
}

impl Consumer {
    pub fn new(broker: Arc<dyn MessageChannel>, config: ConsumerConfig) -> Self {
        let prefetch = config.prefetch.max(1);
        let (shutdown, _) = watch::channel(false);
        let name = format!("{}-{}", config.name_prefix, Uuid::new_v4());
        Self {
            broker,
            semaphore: Arc::new(Semaphore::new(prefetch)),
            config: ConsumerConfig { prefetch, ..config },
            shutdown,
            name,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Number of handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.config.prefetch - self.semaphore.available_permits()
    }

    /// Consume `channel` until shutdown, then wait for in-flight handlers.
    ///
    /// Several channels may be consumed concurrently through one consumer;
    /// they share its concurrency limit. Unsettled deliveries idle for
    /// `claim_min_idle` are taken over, starting with the first poll, so
    /// whatever a crashed process left behind is handled again.
    ///
    /// Shutdown is only observed between polls: a receive that returned
    /// deliveries always hands every one of them to a handler.
    pub async fn run(&self, channel: Channel, handler: Arc<dyn MessageHandler>) -> QueueResult<()> {
        self.broker.init(channel).await?;
        info!(
            consumer = %self.name,
            channel = %channel,
            prefetch = self.config.prefetch,
            claim_min_idle_secs = self.config.claim_min_idle.as_secs(),
            "Starting consumer"
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut last_claim: Option<Instant> = None;
        while !*shutdown_rx.borrow() {
            if last_claim.map_or(true, |at| at.elapsed() >= self.config.claim_interval) {
                last_claim = Some(Instant::now());
                if let Err(e) = self.claim_once(channel, &handler).await {
                    warn!(channel = %channel, "Failed to claim pending messages: {}", e);
                }
            }

            if let Err(e) = self.poll_once(channel, &handler).await {
                error!(channel = %channel, "Error receiving messages: {}", e);
                // Sleeping holds no deliveries, so it can be cut short
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(self.config.error_backoff) => {}
                }
            }
        }

        info!(channel = %channel, "Waiting for in-flight handlers to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_idle())
            .await
            .is_err()
        {
            warn!(channel = %channel, in_flight = self.in_flight(), "Shutdown timed out with handlers still running");
        }

        info!(channel = %channel, "Consumer stopped");
        Ok(())
    }

    async fn poll_once(
        &self,
        channel: Channel,
        handler: &Arc<dyn MessageHandler>,
    ) -> QueueResult<()> {
        let available = self.semaphore.available_permits();
        if available == 0 {
            // All slots busy, wait a bit
            tokio::time::sleep(Duration::from_millis(50)).await;
            return Ok(());
        }

        let deliveries = self
            .broker
            .receive(channel, &self.name, available, self.config.block)
            .await?;

        if deliveries.is_empty() {
            return Ok(());
        }
        debug!(channel = %channel, count = deliveries.len(), "Received messages");

        self.spawn_all(deliveries, handler).await;
        Ok(())
    }

    /// Take over deliveries left unsettled by other consumers.
    async fn claim_once(
        &self,
        channel: Channel,
        handler: &Arc<dyn MessageHandler>,
    ) -> QueueResult<()> {
        let available = self.semaphore.available_permits();
        if available == 0 {
            return Ok(());
        }

        let claimed = self
            .broker
            .claim_pending(channel, &self.name, self.config.claim_min_idle, available)
            .await?;
        // A slow handler of our own can exceed the idle threshold; it is
        // still running, so it must not be started twice.
        let claimed: Vec<Delivery> = {
            let active = self.active.lock().unwrap_or_else(|p| p.into_inner());
            claimed
                .into_iter()
                .filter(|d| !active.contains(&d.id))
                .collect()
        };
        if claimed.is_empty() {
            return Ok(());
        }

        info!(channel = %channel, count = claimed.len(), "Claimed pending messages");
        self.spawn_all(claimed, handler).await;
        Ok(())
    }

    /// Hand every delivery to its own handler task. Waits for permits
    /// rather than dropping anything already taken from the broker.
    async fn spawn_all(&self, deliveries: Vec<Delivery>, handler: &Arc<dyn MessageHandler>) {
        for delivery in deliveries {
            let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                // Closed semaphore: the broker redelivers through claiming
                warn!(message_id = %delivery.id, "Consumer closed, leaving message pending");
                continue;
            };
            let broker = Arc::clone(&self.broker);
            let handler = Arc::clone(handler);
            let active = Arc::clone(&self.active);
            active
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(delivery.id.clone());

            tokio::spawn(async move {
                let _permit = permit;
                let outcome = dispatch(handler, delivery.clone()).await;
                settle(broker.as_ref(), &delivery, outcome).await;
                active
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&delivery.id);
            });
        }
    }

    async fn wait_idle(&self) {
        while self.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Run the handler on its own task so a panic becomes a nack instead of
/// tearing down the loop.
async fn dispatch(handler: Arc<dyn MessageHandler>, delivery: Delivery) -> Outcome {
    let id = delivery.id.clone();
    let channel = delivery.channel;
    match tokio::spawn(async move { handler.handle(&delivery).await }).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            error!(channel = %channel, message_id = %id, "Handler failed: {:#}", e);
            Outcome::Nack { requeue: false }
        }
        Err(join_err) => {
            error!(channel = %channel, message_id = %id, "Handler panicked: {}", join_err);
            Outcome::Nack { requeue: false }
        }
    }
}

async fn settle(broker: &dyn MessageChannel, delivery: &Delivery, outcome: Outcome) {
    let result = match outcome {
        Outcome::Ack => broker.ack(delivery).await,
        Outcome::Nack { requeue } => broker.nack(delivery, requeue).await,
    };
    if let Err(e) = result {
        error!(
            channel = %delivery.channel,
            message_id = %delivery.id,
            ?outcome,
            "Failed to settle message: {}",
            e
        );
    }
}
