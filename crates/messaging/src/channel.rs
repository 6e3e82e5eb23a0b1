use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::CorrelationId;
use uuid::Uuid;

use crate::{Delivery, Envelope, Message, Result};

/// A message that exhausted its retries or could not be parsed.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message_id: Uuid,
    pub topic: String,
    pub correlation_id: Option<CorrelationId>,
    pub payload: serde_json::Value,
    pub attempt: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Core trait for durable message channel implementations.
///
/// Delivery is at-least-once: a leased message that is not settled before
/// its visibility timeout is handed out again. Within one topic, messages
/// are leased in publish order. All implementations must be thread-safe.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Durably enqueues an envelope on its topic.
    async fn publish(&self, envelope: Envelope) -> Result<()>;

    /// Leases up to `max` visible messages from `topic`.
    async fn receive(&self, topic: &str, max: usize) -> Result<Vec<Delivery>>;

    /// Removes a successfully handled delivery.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Releases a delivery for redelivery after `delay`.
    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<()>;

    /// Moves a delivery to the dead-letter destination.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()>;

    /// Lists dead-lettered messages for a topic, oldest first.
    async fn dead_letters(&self, topic: &str) -> Result<Vec<DeadLetter>>;
}

/// Extension trait providing typed publishing.
#[async_trait]
pub trait MessageChannelExt: MessageChannel {
    /// Wraps and publishes a message on its topic.
    async fn publish_message<M: Message>(&self, message: &M) -> Result<()> {
        let envelope = Envelope::wrap(message)?;
        self.publish(envelope).await
    }
}

// Blanket implementation for all MessageChannel implementations
impl<T: MessageChannel + ?Sized> MessageChannelExt for T {}
