//! Queue error types.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("declare of queue '{queue}' failed: {reason}")]
    Declare { queue: String, reason: String },

    #[error("publish error: {0}")]
    Publish(String),

    #[error("publish rejected by broker: {0}")]
    Rejected(String),

    #[error("acknowledge error: {0}")]
    Ack(String),

    #[error("broker blocked for more than {0:?}")]
    Timeout(Duration),

    #[error("invalid broker configuration: {0}")]
    Config(String),
}
