//! Redis Streams backend.
//!
//! Each channel is one stream with a shared consumer group. Acked entries are
//! deleted; rejected entries are copied to `<stream>:dlq` first.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::channel::{Channel, Delivery, MessageChannel};
use crate::error::{QueueError, QueueResult};
use crate::message::QueueMessage;

/// Field holding the JSON body in each stream entry.
const BODY_FIELD: &str = "message";

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Prefix prepended to channel names to form stream keys
    pub stream_prefix: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Approximate cap on stream length (XADD MAXLEN ~)
    pub max_stream_len: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_prefix: "mflow:".to_string(),
            consumer_group: "mflow".to_string(),
            max_stream_len: None,
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_prefix: std::env::var("QUEUE_STREAM_PREFIX").unwrap_or(defaults.stream_prefix),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            max_stream_len: std::env::var("QUEUE_MAX_STREAM_LEN")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }

    pub fn stream_key(&self, channel: Channel) -> String {
        format!("{}{}", self.stream_prefix, channel.name())
    }

    pub fn dlq_key(&self, channel: Channel) -> String {
        format!("{}:dlq", self.stream_key(channel))
    }
}

/// Message channel backed by Redis Streams.
pub struct RedisChannel {
    client: redis::Client,
    conn: MultiplexedConnection,
    /// One connection per (consumer, channel) for blocking reads, so a
    /// parked XREADGROUP never stalls publishes or another channel's reads
    blocking: Mutex<HashMap<(String, Channel), MultiplexedConnection>>,
    config: QueueConfig,
}

impl RedisChannel {
    /// Connect and verify the broker is reachable.
    pub async fn connect(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))?;

        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))?;

        info!(prefix = %config.stream_prefix, group = %config.consumer_group, "Connected to Redis");
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Create from environment variables.
    pub async fn from_env() -> QueueResult<Self> {
        Self::connect(QueueConfig::from_env()).await
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn append(
        &self,
        key: &str,
        fields: &[(&str, &str)],
    ) -> QueueResult<String> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key);
        if let Some(max_len) = self.config.max_stream_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(*value);
        }
        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id)
    }

    fn blocking_conns(&self) -> MutexGuard<'_, HashMap<(String, Channel), MultiplexedConnection>> {
        self.blocking.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn blocking_conn(
        &self,
        consumer: &str,
        channel: Channel,
    ) -> QueueResult<MultiplexedConnection> {
        let key = (consumer.to_string(), channel);
        if let Some(conn) = self.blocking_conns().get(&key) {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        self.blocking_conns().insert(key, conn.clone());
        debug!(consumer, channel = %channel, "Opened blocking read connection");
        Ok(conn)
    }

    fn to_deliveries(&self, channel: Channel, entries: Vec<StreamId>) -> Vec<Delivery> {
        let key = self.config.stream_key(channel);
        entries
            .into_iter()
            .map(|entry| {
                let body = match entry.map.get(BODY_FIELD) {
                    Some(redis::Value::BulkString(bytes)) => {
                        String::from_utf8_lossy(bytes).into_owned()
                    }
                    Some(redis::Value::SimpleString(s)) => s.clone(),
                    _ => {
                        // An entry without a body can never be handled; surface
                        // it as an empty body so the handler drops it.
                        warn!(message_id = %entry.id, stream = %key, "Stream entry has no body field");
                        String::new()
                    }
                };
                Delivery {
                    id: entry.id,
                    channel,
                    body,
                }
            })
            .collect()
    }

    /// Number of entries waiting in a channel's dead-letter stream.
    pub async fn dlq_len(&self, channel: Channel) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(self.config.dlq_key(channel)).await?;
        Ok(len)
    }
}

#[async_trait]
impl MessageChannel for RedisChannel {
    async fn init(&self, channel: Channel) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let key = self.config.stream_key(channel);

        // Create consumer group (ignore error if already exists)
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&key)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group {} on {}", self.config.consumer_group, key),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists on {}", key);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    async fn publish(&self, channel: Channel, message: &QueueMessage) -> QueueResult<String> {
        channel.ensure_accepts(message)?;
        let body = message.to_body()?;
        let key = self.config.stream_key(channel);

        let id = self
            .append(&key, &[(BODY_FIELD, body.as_str())])
            .await
            .map_err(|e| QueueError::publish_failed(format!("{}: {}", key, e)))?;

        metrics::counter!("mflow_messages_published_total", "channel" => channel.name())
            .increment(1);
        debug!(channel = %channel, message_id = %id, job_id = %message.job_id(), "Published message");
        Ok(id)
    }

    async fn receive(
        &self,
        channel: Channel,
        consumer: &str,
        max: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.blocking_conn(consumer, channel).await?;
        let key = self.config.stream_key(channel);

        let reply: Result<StreamReadReply, redis::RedisError> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(max.max(1))
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&key)
            .arg(">")
            .query_async(&mut conn)
            .await;
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                // Reconnect on the next call
                self.blocking_conns().remove(&(consumer.to_string(), channel));
                return Err(e.into());
            }
        };

        let entries = reply.keys.into_iter().flat_map(|k| k.ids).collect();
        Ok(self.to_deliveries(channel, entries))
    }

    async fn claim_pending(
        &self,
        channel: Channel,
        consumer: &str,
        min_idle: Duration,
        max: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.conn.clone();
        let key = self.config.stream_key(channel);
        let min_idle_ms = min_idle.as_millis() as u64;

        // Oldest entries first, only those idle long enough
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&key)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(max.max(1))
            .query_async(&mut conn)
            .await?;
        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&key)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(min_idle_ms);
        for entry in &pending.ids {
            cmd.arg(&entry.id);
        }
        // Entries claimed meanwhile by another consumer are no longer idle
        // and come back missing from the reply.
        let claimed: StreamClaimReply = cmd.query_async(&mut conn).await?;

        for entry in &pending.ids {
            debug!(
                channel = %channel,
                message_id = %entry.id,
                previous_consumer = %entry.consumer,
                times_delivered = entry.times_delivered,
                "Claiming pending message"
            );
        }
        metrics::counter!("mflow_messages_claimed_total", "channel" => channel.name())
            .increment(claimed.ids.len() as u64);
        Ok(self.to_deliveries(channel, claimed.ids))
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let key = self.config.stream_key(delivery.channel);

        redis::cmd("XACK")
            .arg(&key)
            .arg(&self.config.consumer_group)
            .arg(&delivery.id)
            .query_async::<()>(&mut conn)
            .await?;

        // Delete the message from the stream
        redis::cmd("XDEL")
            .arg(&key)
            .arg(&delivery.id)
            .query_async::<()>(&mut conn)
            .await?;

        debug!(channel = %delivery.channel, message_id = %delivery.id, "Acknowledged message");
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> QueueResult<()> {
        if requeue {
            let key = self.config.stream_key(delivery.channel);
            let new_id = self
                .append(&key, &[(BODY_FIELD, delivery.body.as_str())])
                .await?;
            self.ack(delivery).await?;
            debug!(channel = %delivery.channel, message_id = %delivery.id, %new_id, "Requeued message");
            return Ok(());
        }

        let dlq_key = self.config.dlq_key(delivery.channel);
        self.append(
            &dlq_key,
            &[
                (BODY_FIELD, delivery.body.as_str()),
                ("channel", delivery.channel.name()),
                ("original_id", delivery.id.as_str()),
            ],
        )
        .await?;

        // Ack the original message
        self.ack(delivery).await?;

        metrics::counter!("mflow_messages_dead_lettered_total", "channel" => delivery.channel.name())
            .increment(1);
        warn!(channel = %delivery.channel, message_id = %delivery.id, "Moved message to {}", dlq_key);
        Ok(())
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))?;
        Ok(())
    }
}
