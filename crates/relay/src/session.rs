//! Opening the resources of one consumer session.

use std::sync::Arc;

use tracing::{info, warn};

use rowbus_core::RelayError;
use rowbus_queue::{Broker, QueueConsumer};
use rowbus_store::{ProcedureTarget, TargetConnector};

/// At most one unacknowledged delivery per consumer.
pub const PREFETCH: u16 = 1;

/// Broker subscription and target connection owned by one session.
pub struct Session {
    pub consumer: Box<dyn QueueConsumer>,
    pub target: Box<dyn ProcedureTarget>,
}

impl Session {
    /// Release both connections. Unacked deliveries return to the queue.
    pub async fn close(mut self) {
        if let Err(e) = self.consumer.close().await {
            warn!(error = %e, "closing broker session failed");
        }
        self.target.close().await;
    }
}

/// Opens sessions against one queue and one procedure target.
#[derive(Clone)]
pub struct SessionConnector {
    broker: Arc<dyn Broker>,
    targets: Arc<dyn TargetConnector>,
    queue: String,
}

impl SessionConnector {
    pub fn new(broker: Arc<dyn Broker>, targets: Arc<dyn TargetConnector>, queue: &str) -> Self {
        Self {
            broker,
            targets,
            queue: queue.to_string(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Subscribe to the queue (declared durable, prefetch 1) and connect the
    /// target. Any failure is a connection-level error.
    pub async fn connect(&self) -> Result<Session, RelayError> {
        let mut consumer = self
            .broker
            .consumer(&self.queue, PREFETCH)
            .await
            .map_err(|e| RelayError::Connection(format!("broker: {e}")))?;

        let target = match self.targets.connect().await {
            Ok(target) => target,
            Err(e) => {
                if let Err(close) = consumer.close().await {
                    warn!(error = %close, "closing broker session failed");
                }
                return Err(RelayError::Connection(format!("target database: {e}")));
            }
        };

        info!(queue = %self.queue, prefetch = PREFETCH, "session connected");
        Ok(Session { consumer, target })
    }
}
