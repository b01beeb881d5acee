//! Consumer loop: one delivery at a time into the stored procedure.
//!
//! Per session the dispatcher moves through
//! `Connecting → Listening → Processing → Listening … → Terminated`.
//! A delivery is acknowledged only after the procedure call committed.
//! Message-level failures never end the session; anything that breaks the
//! broker subscription or the target connection does.

use std::num::NonZeroUsize;

use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use rowbus_core::config::FailurePolicy;
use rowbus_core::RelayError;
use rowbus_queue::{Delivery, QueueConsumer, QueueError};
use rowbus_store::ProcedureTarget;

use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Listening,
    Processing,
    Terminated,
}

/// Latest state of the consumer, observable through [`Dispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    /// 1-based count of sessions started by this process.
    pub session: u64,
    pub state: SessionState,
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    /// Procedure failed; the delivery stays unacknowledged on this channel.
    LeftUnacked,
    /// Procedure failed; the delivery went back to the queue.
    Requeued { attempt: u32 },
    /// Procedure failed too often; the body now sits in the dead-letter queue.
    DeadLettered { attempts: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub acked: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

type BodyDigest = [u8; 32];

/// Bodies whose failure count is remembered; the least recently failed is
/// forgotten first.
const TRACKED_BODIES: NonZeroUsize = match NonZeroUsize::new(4096) {
    Some(n) => n,
    None => panic!("capacity must be non-zero"),
};

fn digest(body: &[u8]) -> BodyDigest {
    Sha256::digest(body).into()
}

fn lost(e: QueueError) -> RelayError {
    RelayError::Connection(format!("broker: {e}"))
}

pub struct Dispatcher {
    queue: String,
    policy: FailurePolicy,
    /// Failure counts of requeued bodies. Survives reconnects, bounded by
    /// [`TRACKED_BODIES`].
    attempts: LruCache<BodyDigest, u32>,
    stats: DispatchStats,
    status: watch::Sender<SessionStatus>,
}

impl Dispatcher {
    pub fn new(queue: &str, policy: FailurePolicy) -> Self {
        let (status, _) = watch::channel(SessionStatus {
            session: 0,
            state: SessionState::Terminated,
        });
        Self {
            queue: queue.to_string(),
            policy,
            attempts: LruCache::new(TRACKED_BODIES),
            stats: DispatchStats::default(),
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Mark the start of a new session (state `Connecting`).
    pub fn begin_session(&self) {
        self.status.send_modify(|s| {
            s.session += 1;
            s.state = SessionState::Connecting;
        });
    }

    pub fn set_state(&self, state: SessionState) {
        self.status.send_modify(|s| s.state = state);
    }

    /// Consume until the session breaks. Always returns the session-level
    /// error that ended it.
    pub async fn run_session(&mut self, session: &mut Session) -> RelayError {
        let Session { consumer, target } = session;
        info!(queue = %self.queue, "listening for messages");

        loop {
            self.set_state(SessionState::Listening);
            let delivery = match consumer.next_delivery().await {
                Ok(delivery) => delivery,
                Err(e) => return lost(e),
            };

            self.set_state(SessionState::Processing);
            if let Err(e) = self
                .handle(consumer.as_mut(), target.as_mut(), delivery)
                .await
            {
                return e;
            }
        }
    }

    /// Process one delivery. `Err` is reserved for session-level failures.
    pub async fn handle(
        &mut self,
        consumer: &mut dyn QueueConsumer,
        target: &mut dyn ProcedureTarget,
        delivery: Delivery,
    ) -> Result<Outcome, RelayError> {
        let tag = delivery.delivery_tag;

        match target.invoke(&delivery.body).await {
            Ok(()) => {
                consumer.ack(tag).await.map_err(lost)?;
                if matches!(self.policy, FailurePolicy::DeadLetter { .. }) {
                    self.attempts.pop(&digest(&delivery.body));
                }
                self.stats.acked += 1;
                debug!(queue = %self.queue, delivery_tag = tag, "message acknowledged");
                Ok(Outcome::Acked)
            }
            Err(e) if e.is_connection() => Err(RelayError::from(e)),
            Err(e) => {
                self.stats.failed += 1;
                let e = RelayError::from(e);
                error!(
                    queue = %self.queue,
                    delivery_tag = tag,
                    redelivered = delivery.redelivered,
                    error = %e,
                    "message processing failed"
                );
                self.after_failure(consumer, &delivery).await
            }
        }
    }

    async fn after_failure(
        &mut self,
        consumer: &mut dyn QueueConsumer,
        delivery: &Delivery,
    ) -> Result<Outcome, RelayError> {
        let FailurePolicy::DeadLetter { max_attempts } = self.policy else {
            return Ok(Outcome::LeftUnacked);
        };

        // Only a redelivery continues an earlier count. A first delivery with
        // the same body (e.g. a rerun job) starts over.
        let key = digest(&delivery.body);
        let previous = if delivery.redelivered {
            self.attempts.get(&key).copied().unwrap_or(0)
        } else {
            0
        };
        let attempt = previous + 1;
        self.attempts.put(key, attempt);

        if attempt >= max_attempts {
            consumer.dead_letter(delivery).await.map_err(lost)?;
            self.attempts.pop(&key);
            self.stats.dead_lettered += 1;
            warn!(
                queue = %self.queue,
                delivery_tag = delivery.delivery_tag,
                attempts = attempt,
                "giving up on message"
            );
            Ok(Outcome::DeadLettered { attempts: attempt })
        } else {
            consumer
                .nack(delivery.delivery_tag, true)
                .await
                .map_err(lost)?;
            debug!(
                queue = %self.queue,
                delivery_tag = delivery.delivery_tag,
                attempt,
                max_attempts,
                "message requeued"
            );
            Ok(Outcome::Requeued { attempt })
        }
    }
}
