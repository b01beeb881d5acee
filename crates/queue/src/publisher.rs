use async_trait::async_trait;

use crate::error::QueueError;

/// One connection plus one channel used to publish to the default exchange.
#[async_trait]
pub trait QueuePublisher: Send {
    /// Declare `queue` durable. Redeclaring with identical parameters is a no-op.
    async fn declare_queue(&mut self, queue: &str) -> Result<(), QueueError>;

    /// Publish one persistent message with routing key = `queue`.
    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), QueueError>;

    async fn close(&mut self) -> Result<(), QueueError>;
}
