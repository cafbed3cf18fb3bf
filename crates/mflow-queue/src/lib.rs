//! Typed message channels over a durable broker.
//!
//! This crate provides:
//! - Wire messages for dispatch, completion and failure channels
//! - The `MessageChannel` trait with explicit ack/nack
//! - A Redis Streams backend with per-channel dead-letter streams
//! - An in-memory backend for tests and local runs
//! - A bounded-concurrency consumer loop

pub mod channel;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod message;
pub mod streams;

pub use channel::{Channel, Delivery, MessageChannel};
pub use consumer::{Consumer, ConsumerConfig, MessageHandler, Outcome};
pub use error::{QueueError, QueueResult};
pub use memory::InMemoryChannel;
pub use message::{QueueMessage, TaskCompletedEvent, TaskFailedEvent, TaskMessage};
pub use streams::{QueueConfig, RedisChannel};
