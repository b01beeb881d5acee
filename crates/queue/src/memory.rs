//! In-process broker with durable-queue, prefetch and acknowledgment semantics.
//!
//! Mirrors the parts of RabbitMQ the pipeline relies on: idempotent durable
//! declaration (a mismatched redeclare fails), FIFO queues, per-consumer
//! prefetch, requeue of unacknowledged deliveries when a consumer closes, and
//! messages to an undeclared queue being dropped by the default exchange.
//! Test hooks simulate connection drops, refused connections and publish
//! failures.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::broker::Broker;
use crate::consumer::{dead_letter_queue, Delivery, QueueConsumer};
use crate::error::QueueError;
use crate::publisher::QueuePublisher;

#[derive(Debug, Clone)]
struct Stored {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct MemoryQueue {
    durable: bool,
    ready: VecDeque<Stored>,
}

#[derive(Debug)]
struct ConsumerState {
    queue: String,
    prefetch: u16,
    unacked: BTreeMap<u64, Stored>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, MemoryQueue>,
    consumers: HashMap<u64, ConsumerState>,
    /// Bumped by [`MemoryBroker::drop_connections`]; sessions from an older
    /// generation are dead.
    generation: u64,
    next_id: u64,
    next_tag: u64,
    refuse_connections: usize,
    publish_budget: Option<usize>,
    connections_opened: usize,
    acked: usize,
}

impl State {
    fn declare(&mut self, queue: &str, durable: bool) -> Result<(), QueueError> {
        match self.queues.get(queue) {
            Some(existing) if existing.durable != durable => Err(QueueError::Declare {
                queue: queue.to_string(),
                reason: format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' (existing: {})",
                    existing.durable
                ),
            }),
            Some(_) => Ok(()),
            None => {
                self.queues.insert(
                    queue.to_string(),
                    MemoryQueue {
                        durable,
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn open_connection(&mut self) -> Result<u64, QueueError> {
        if self.refuse_connections > 0 {
            self.refuse_connections -= 1;
            return Err(QueueError::Connection("connection refused".to_string()));
        }
        self.connections_opened += 1;
        Ok(self.generation)
    }

    fn alive(&self, generation: u64) -> Result<(), QueueError> {
        if generation == self.generation {
            Ok(())
        } else {
            Err(QueueError::Connection("connection reset by broker".to_string()))
        }
    }

    /// Return a consumer's unacked deliveries to the head of its queue, in order.
    fn release(&mut self, id: u64) {
        let Some(consumer) = self.consumers.remove(&id) else {
            return;
        };
        if let Some(queue) = self.queues.get_mut(&consumer.queue) {
            for (_, mut stored) in consumer.unacked.into_iter().rev() {
                stored.redelivered = true;
                queue.ready.push_front(stored);
            }
        }
    }

    fn route(&mut self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        if let Some(budget) = self.publish_budget.as_mut() {
            if *budget == 0 {
                return Err(QueueError::Publish("channel closed by broker".to_string()));
            }
            *budget -= 1;
        }
        match self.queues.get_mut(queue) {
            Some(q) => q.ready.push_back(Stored {
                body: body.to_vec(),
                redelivered: false,
            }),
            None => debug!(queue, "unroutable message dropped"),
        }
        Ok(())
    }
}

/// Shared in-memory broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Declare a queue directly, e.g. to set up a non-durable one.
    pub fn declare(&self, queue: &str, durable: bool) -> Result<(), QueueError> {
        self.lock().declare(queue, durable)
    }

    /// Bodies waiting in `queue`, head first. Unacked deliveries are not included.
    pub fn ready(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|s| s.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unacked(&self, queue: &str) -> usize {
        self.lock()
            .consumers
            .values()
            .filter(|c| c.queue == queue)
            .map(|c| c.unacked.len())
            .sum()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn acked(&self) -> usize {
        self.lock().acked
    }

    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    pub fn active_consumers(&self) -> usize {
        self.lock().consumers.len()
    }

    /// Kill every open session. Unacked deliveries go back to their queues.
    pub fn drop_connections(&self) {
        {
            let mut state = self.lock();
            state.generation += 1;
            let ids: Vec<u64> = state.consumers.keys().copied().collect();
            for id in ids {
                state.release(id);
            }
        }
        self.notify.notify_waiters();
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connections(&self, n: usize) {
        self.lock().refuse_connections = n;
    }

    /// Let `n` more publishes succeed, then fail every publish.
    pub fn fail_publish_after(&self, n: usize) {
        self.lock().publish_budget = Some(n);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publisher(&self) -> Result<Box<dyn QueuePublisher>, QueueError> {
        let generation = self.lock().open_connection()?;
        Ok(Box::new(MemoryPublisher {
            broker: self.clone(),
            generation,
            open: true,
        }))
    }

    async fn consumer(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn QueueConsumer>, QueueError> {
        let mut state = self.lock();
        let generation = state.open_connection()?;
        state.declare(queue, true)?;
        state.next_id += 1;
        let id = state.next_id;
        state.consumers.insert(
            id,
            ConsumerState {
                queue: queue.to_string(),
                prefetch: prefetch.max(1),
                unacked: BTreeMap::new(),
            },
        );
        drop(state);

        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            id,
            generation,
            queue: queue.to_string(),
        }))
    }
}

pub struct MemoryPublisher {
    broker: MemoryBroker,
    generation: u64,
    open: bool,
}

impl MemoryPublisher {
    fn check(&self, state: &State) -> Result<(), QueueError> {
        if !self.open {
            return Err(QueueError::Connection("publisher closed".to_string()));
        }
        state.alive(self.generation)
    }
}

#[async_trait]
impl QueuePublisher for MemoryPublisher {
    async fn declare_queue(&mut self, queue: &str) -> Result<(), QueueError> {
        let mut state = self.broker.lock();
        self.check(&state)?;
        state.declare(queue, true)
    }

    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        {
            let mut state = self.broker.lock();
            self.check(&state)?;
            state.route(queue, payload)?;
        }
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        self.open = false;
        Ok(())
    }
}

pub struct MemoryConsumer {
    broker: MemoryBroker,
    id: u64,
    generation: u64,
    queue: String,
}

impl MemoryConsumer {
    fn take_unacked(&self, delivery_tag: u64) -> Result<Stored, QueueError> {
        let mut state = self.broker.lock();
        state.alive(self.generation)?;
        state
            .consumers
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&delivery_tag))
            .ok_or_else(|| {
                QueueError::Ack(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"))
            })
    }
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    async fn next_delivery(&mut self) -> Result<Delivery, QueueError> {
        let notify = self.broker.notify.clone();
        loop {
            // Registered before inspecting state so a concurrent publish is not missed.
            let notified = notify.notified();
            {
                let mut state = self.broker.lock();
                state.alive(self.generation)?;
                let State {
                    queues,
                    consumers,
                    next_tag,
                    ..
                } = &mut *state;
                let consumer = consumers.get_mut(&self.id).ok_or_else(|| {
                    QueueError::Connection("consumer closed".to_string())
                })?;
                if consumer.unacked.len() < consumer.prefetch as usize {
                    if let Some(stored) = queues
                        .get_mut(&self.queue)
                        .and_then(|q| q.ready.pop_front())
                    {
                        *next_tag += 1;
                        let tag = *next_tag;
                        consumer.unacked.insert(tag, stored.clone());
                        return Ok(Delivery {
                            delivery_tag: tag,
                            body: stored.body,
                            redelivered: stored.redelivered,
                        });
                    }
                }
            }
            notified.await;
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), QueueError> {
        self.take_unacked(delivery_tag)?;
        self.broker.lock().acked += 1;
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError> {
        let mut stored = self.take_unacked(delivery_tag)?;
        if requeue {
            stored.redelivered = true;
            let mut state = self.broker.lock();
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                queue.ready.push_front(stored);
            }
        }
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        let target = dead_letter_queue(&self.queue);
        {
            let mut state = self.broker.lock();
            state.alive(self.generation)?;
            state.declare(&target, true)?;
            state.route(&target, &delivery.body)?;
        }
        self.ack(delivery.delivery_tag).await
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        self.broker.lock().release(self.id);
        self.broker.notify.notify_waiters();
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.broker.lock().release(self.id);
        self.broker.notify.notify_waiters();
    }
}
