//! RabbitMQ (AMQP 0-9-1) broker implementation.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info, warn};

use rowbus_core::config::BrokerConfig;

use crate::broker::Broker;
use crate::consumer::{dead_letter_queue, Delivery, QueueConsumer};
use crate::error::QueueError;
use crate::publisher::QueuePublisher;

/// AMQP delivery mode 2: the broker writes the message to disk.
const PERSISTENT: u8 = 2;

/// Opens RabbitMQ connections from [`BrokerConfig`].
///
/// The heartbeat is negotiated through the URI. Operations that broker flow
/// control can stall (publish, ack, nack) are bounded by the blocked timeout.
pub struct AmqpBroker {
    uri: String,
    blocked_timeout: Duration,
    publish_confirms: bool,
}

impl AmqpBroker {
    pub fn new(config: &BrokerConfig) -> Result<Self, QueueError> {
        let uri = config
            .amqp_uri()
            .map_err(|e| QueueError::Config(e.to_string()))?;
        Ok(Self {
            uri,
            blocked_timeout: config.blocked_timeout(),
            publish_confirms: config.publish_confirms,
        })
    }

    async fn open(&self, name: &str) -> Result<(Connection, Channel), QueueError> {
        let properties = ConnectionProperties::default().with_connection_name(name.into());
        let connection = Connection::connect(&self.uri, properties)
            .await
            .map_err(|e| QueueError::Connection(format!("failed to connect to broker: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Connection(format!("failed to create channel: {e}")))?;
        Ok((connection, channel))
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publisher(&self) -> Result<Box<dyn QueuePublisher>, QueueError> {
        let (connection, channel) = self.open("rowbus-producer").await?;
        if self.publish_confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| QueueError::Connection(format!("confirm.select failed: {e}")))?;
        }
        info!(confirms = self.publish_confirms, "AMQP publisher connected");

        Ok(Box::new(AmqpPublisher {
            connection,
            channel,
            confirms: self.publish_confirms,
            blocked_timeout: self.blocked_timeout,
        }))
    }

    async fn consumer(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn QueueConsumer>, QueueError> {
        let (connection, channel) = self.open("rowbus-consumer").await?;
        declare_durable(&channel, queue).await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Connection(format!("basic.qos failed: {e}")))?;
        let consumer = channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Connection(format!("basic.consume failed: {e}")))?;
        info!(queue, prefetch, "AMQP consumer subscribed");

        Ok(Box::new(AmqpConsumer {
            connection,
            channel,
            consumer,
            queue: queue.to_string(),
            dead_letter_declared: false,
            blocked_timeout: self.blocked_timeout,
        }))
    }
}

async fn declare_durable(channel: &Channel, queue: &str) -> Result<(), QueueError> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map(|_| ())
        .map_err(|e| QueueError::Declare {
            queue: queue.to_string(),
            reason: e.to_string(),
        })
}

fn persistent_json() -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_content_type("application/json".into())
}

/// Run a broker operation, failing with [`QueueError::Timeout`] if it stays
/// blocked longer than `limit`.
async fn bounded<T, F>(
    limit: Duration,
    fut: F,
    on_error: impl FnOnce(lapin::Error) -> QueueError,
) -> Result<T, QueueError>
where
    F: Future<Output = Result<T, lapin::Error>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(on_error),
        Err(_) => Err(QueueError::Timeout(limit)),
    }
}

async fn publish_on(
    channel: &Channel,
    queue: &str,
    payload: &[u8],
    confirms: bool,
    limit: Duration,
) -> Result<(), QueueError> {
    let confirm = bounded(
        limit,
        channel.basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            payload,
            persistent_json(),
        ),
        |e| QueueError::Publish(e.to_string()),
    )
    .await?;

    if confirms {
        let confirmation = bounded(limit, confirm, |e| QueueError::Publish(e.to_string())).await?;
        if confirmation.is_nack() {
            return Err(QueueError::Rejected(format!("broker nacked publish to '{queue}'")));
        }
    }
    Ok(())
}

async fn close_both(channel: &Channel, connection: &Connection) -> Result<(), QueueError> {
    if channel.status().connected() {
        if let Err(e) = channel.close(200, "OK").await {
            debug!(error = %e, "channel close failed");
        }
    }
    if connection.status().connected() {
        connection
            .close(200, "OK")
            .await
            .map_err(|e| QueueError::Connection(format!("connection close failed: {e}")))?;
    }
    Ok(())
}

// ── Publisher ───────────────────────────────────────────────────────

pub struct AmqpPublisher {
    connection: Connection,
    channel: Channel,
    confirms: bool,
    blocked_timeout: Duration,
}

#[async_trait]
impl QueuePublisher for AmqpPublisher {
    async fn declare_queue(&mut self, queue: &str) -> Result<(), QueueError> {
        declare_durable(&self.channel, queue).await
    }

    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        publish_on(
            &self.channel,
            queue,
            payload,
            self.confirms,
            self.blocked_timeout,
        )
        .await
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        close_both(&self.channel, &self.connection).await
    }
}

// ── Consumer ────────────────────────────────────────────────────────

pub struct AmqpConsumer {
    connection: Connection,
    channel: Channel,
    consumer: lapin::Consumer,
    queue: String,
    dead_letter_declared: bool,
    blocked_timeout: Duration,
}

#[async_trait]
impl QueueConsumer for AmqpConsumer {
    async fn next_delivery(&mut self) -> Result<Delivery, QueueError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Delivery {
                delivery_tag: delivery.delivery_tag,
                body: delivery.data,
                redelivered: delivery.redelivered,
            }),
            Some(Err(e)) => Err(QueueError::Connection(format!("consume failed: {e}"))),
            None => Err(QueueError::Connection(format!(
                "consumer on '{}' was cancelled",
                self.queue
            ))),
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), QueueError> {
        bounded(
            self.blocked_timeout,
            self.channel
                .basic_ack(delivery_tag, BasicAckOptions::default()),
            |e| QueueError::Ack(e.to_string()),
        )
        .await
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError> {
        bounded(
            self.blocked_timeout,
            self.channel.basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            ),
            |e| QueueError::Ack(e.to_string()),
        )
        .await
    }

    async fn dead_letter(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        let target = dead_letter_queue(&self.queue);
        if !self.dead_letter_declared {
            declare_durable(&self.channel, &target).await?;
            self.dead_letter_declared = true;
        }
        publish_on(
            &self.channel,
            &target,
            &delivery.body,
            false,
            self.blocked_timeout,
        )
        .await?;
        warn!(
            queue = %self.queue,
            dead_letter = %target,
            delivery_tag = delivery.delivery_tag,
            "message moved to dead-letter queue"
        );
        self.ack(delivery.delivery_tag).await
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        close_both(&self.channel, &self.connection).await
    }
}
