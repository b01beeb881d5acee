//! Queue consumer trait and types.

use async_trait::async_trait;

use crate::error::QueueError;

/// One in-flight message handed to a consumer and not yet acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped handle used to ack or nack this delivery.
    pub delivery_tag: u64,
    /// Raw message body (JSON object bytes).
    pub body: Vec<u8>,
    /// Set by the broker when this message was handed out before.
    pub redelivered: bool,
}

/// Name of the queue that receives messages given up on by the consumer.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}.dead-letter")
}

/// A subscription to one queue on one channel.
///
/// Every error returned here is session-level: the channel or connection is
/// unusable and the caller should tear the session down.
#[async_trait]
pub trait QueueConsumer: Send {
    /// Wait for the next delivery. This is the only point where a consumer
    /// session suspends while idle.
    async fn next_delivery(&mut self) -> Result<Delivery, QueueError>;

    /// Acknowledge successful processing; the broker forgets the message.
    async fn ack(&mut self, delivery_tag: u64) -> Result<(), QueueError>;

    /// Negative-acknowledge. With `requeue` the broker redelivers the message.
    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError>;

    /// Publish the body to the dead-letter queue, then acknowledge the original.
    async fn dead_letter(&mut self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Close channel and connection. Unacknowledged deliveries return to the queue.
    async fn close(&mut self) -> Result<(), QueueError>;
}
