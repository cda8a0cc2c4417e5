//! Durable at-least-once queue seams, plus the two loops that drain them.

use async_trait::async_trait;
use thiserror::Error;

use crate::db::redis::redis_pool::StoreError;

pub mod consumer;
pub mod handler;
pub mod streams;

/// One delivery of a queued payload. `deliveries` is 1 on first delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub payload: String,
    pub deliveries: u64,
}

/// Point-in-time consumer counters, logged on the metrics tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerInfo {
    /// Entries not yet delivered to any consumer.
    pub pending: u64,
    /// Delivered but not yet acked.
    pub ack_pending: u64,
    /// Unacked entries delivered more than once.
    pub redelivered: u64,
    /// Consumers attached to the group.
    pub waiting: u64,
}

#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Up to `max` messages: stale unacked entries first, then new ones.
    async fn fetch(&self, max: usize) -> QueueResult<Vec<QueueMessage>>;

    async fn ack(&self, message: &QueueMessage) -> QueueResult<()>;

    /// Makes the message eligible for redelivery on the next fetch.
    async fn nak(&self, message: &QueueMessage) -> QueueResult<()>;

    /// Dead-letters the message; it is never redelivered.
    async fn term(&self, message: &QueueMessage, reason: &str) -> QueueResult<()>;

    async fn info(&self) -> QueueResult<ConsumerInfo>;

    /// Later fetches fail with [`QueueError::Closed`]. Unacked messages stay reclaimable.
    async fn close(&self);
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Appends `payload`, returning the assigned message id.
    async fn publish(&self, payload: &str) -> QueueResult<String>;
}

pub type QueueResult<T> = core::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("consumer is closed")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Store(StoreError::from(e))
    }
}
