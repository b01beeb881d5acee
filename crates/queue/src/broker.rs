use async_trait::async_trait;

use crate::consumer::QueueConsumer;
use crate::error::QueueError;
use crate::publisher::QueuePublisher;

/// Opens broker sessions.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a connection and channel for publishing.
    async fn publisher(&self) -> Result<Box<dyn QueuePublisher>, QueueError>;

    /// Open a connection and channel, declare `queue` durable, apply
    /// `prefetch` and start consuming.
    async fn consumer(&self, queue: &str, prefetch: u16)
        -> Result<Box<dyn QueueConsumer>, QueueError>;
}
