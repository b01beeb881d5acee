//! Live RabbitMQ tests for the AMQP broker.
//!
//! These need a reachable broker configured through the usual `RABBIT_*`
//! variables (a `.env` file is honoured). Every test uses fresh queue names
//! and deletes its queues afterwards.
//!
//! Run with:
//!   cargo test -p rowbus-queue --test rabbitmq_test -- --ignored

use lapin::options::{BasicGetOptions, QueueDeclareOptions, QueueDeleteOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use uuid::Uuid;

use rowbus_core::config::{load_dotenv, BrokerConfig};
use rowbus_core::Config;
use rowbus_queue::{dead_letter_queue, AmqpBroker, Broker, QueueError};

fn broker_config() -> Option<BrokerConfig> {
    load_dotenv();
    let config = Config::from_env().expect("invalid test configuration");
    if config.broker.host.is_none() {
        eprintln!("RABBIT_HOST not set, skipping");
        return None;
    }
    Some(config.broker)
}

fn queue_name() -> String {
    format!("rowbus-test-{}", Uuid::new_v4().simple())
}

/// A plain lapin channel for inspecting queues behind the broker's back.
async fn raw_channel(config: &BrokerConfig) -> (Connection, Channel) {
    let uri = config.amqp_uri().unwrap();
    let connection = Connection::connect(&uri, ConnectionProperties::default())
        .await
        .unwrap();
    let channel = connection.create_channel().await.unwrap();
    (connection, channel)
}

async fn message_count(channel: &Channel, queue: &str) -> u32 {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap()
        .message_count()
}

async fn get(channel: &Channel, queue: &str) -> (Vec<u8>, BasicProperties) {
    let message = channel
        .basic_get(queue, BasicGetOptions { no_ack: true })
        .await
        .unwrap()
        .expect("queue is empty");
    (message.delivery.data, message.delivery.properties)
}

fn assert_persistent_json(properties: &BasicProperties) {
    assert_eq!(*properties.delivery_mode(), Some(2));
    assert_eq!(
        properties.content_type().as_ref().map(|c| c.as_str()),
        Some("application/json")
    );
}

async fn delete(channel: &Channel, queues: &[&str]) {
    for queue in queues {
        channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .ok();
    }
}

#[ignore]
#[tokio::test]
async fn publish_consume_ack_nack_and_dead_letter() {
    let Some(config) = broker_config() else { return };
    let queue = queue_name();
    let dead_letter = dead_letter_queue(&queue);
    let broker = AmqpBroker::new(&config).unwrap();

    let mut publisher = broker.publisher().await.unwrap();
    publisher.declare_queue(&queue).await.unwrap();
    for body in [r#"{"id":1}"#, r#"{"id":2}"#, r#"{"id":3}"#] {
        publisher.publish(&queue, body.as_bytes()).await.unwrap();
    }
    // Redeclaring an existing durable queue is harmless.
    publisher.declare_queue(&queue).await.unwrap();
    publisher.close().await.unwrap();

    let (connection, channel) = raw_channel(&config).await;
    assert_eq!(message_count(&channel, &queue).await, 3);

    let mut consumer = broker.consumer(&queue, 1).await.unwrap();
    let first = consumer.next_delivery().await.unwrap();
    assert_eq!(first.body, br#"{"id":1}"#);
    assert!(!first.redelivered);
    consumer.ack(first.delivery_tag).await.unwrap();

    let second = consumer.next_delivery().await.unwrap();
    assert_eq!(second.body, br#"{"id":2}"#);
    consumer.nack(second.delivery_tag, true).await.unwrap();
    let again = consumer.next_delivery().await.unwrap();
    assert_eq!(again.body, br#"{"id":2}"#);
    assert!(again.redelivered);
    consumer.dead_letter(&again).await.unwrap();
    consumer.close().await.unwrap();

    let (body, properties) = get(&channel, &queue).await;
    assert_eq!(body, br#"{"id":3}"#);
    assert_persistent_json(&properties);

    let (body, properties) = get(&channel, &dead_letter).await;
    assert_eq!(body, br#"{"id":2}"#);
    assert_persistent_json(&properties);

    assert_eq!(message_count(&channel, &queue).await, 0);
    delete(&channel, &[&queue, &dead_letter]).await;
    connection.close(200, "OK").await.ok();
}

#[ignore]
#[tokio::test]
async fn unacked_delivery_returns_when_consumer_closes() {
    let Some(config) = broker_config() else { return };
    let queue = queue_name();
    let broker = AmqpBroker::new(&config).unwrap();

    let mut publisher = broker.publisher().await.unwrap();
    publisher.declare_queue(&queue).await.unwrap();
    publisher.publish(&queue, br#"{"id":1}"#).await.unwrap();
    publisher.close().await.unwrap();

    let mut consumer = broker.consumer(&queue, 1).await.unwrap();
    let delivery = consumer.next_delivery().await.unwrap();
    consumer.close().await.unwrap();

    let mut consumer = broker.consumer(&queue, 1).await.unwrap();
    let redelivered = consumer.next_delivery().await.unwrap();
    assert_eq!(redelivered.body, delivery.body);
    assert!(redelivered.redelivered);
    consumer.ack(redelivered.delivery_tag).await.unwrap();
    consumer.close().await.unwrap();

    let (connection, channel) = raw_channel(&config).await;
    delete(&channel, &[&queue]).await;
    connection.close(200, "OK").await.ok();
}

#[ignore]
#[tokio::test]
async fn confirmed_publish_succeeds() {
    let Some(mut config) = broker_config() else { return };
    config.publish_confirms = true;
    let queue = queue_name();
    let broker = AmqpBroker::new(&config).unwrap();

    let mut publisher = broker.publisher().await.unwrap();
    publisher.declare_queue(&queue).await.unwrap();
    publisher.publish(&queue, br#"{"id":1}"#).await.unwrap();
    publisher.close().await.unwrap();

    let (connection, channel) = raw_channel(&config).await;
    assert_eq!(message_count(&channel, &queue).await, 1);
    delete(&channel, &[&queue]).await;
    connection.close(200, "OK").await.ok();
}

#[ignore]
#[tokio::test]
async fn non_durable_queue_fails_declare() {
    let Some(config) = broker_config() else { return };
    let queue = queue_name();
    let (connection, channel) = raw_channel(&config).await;
    channel
        .queue_declare(&queue, QueueDeclareOptions::default(), FieldTable::default())
        .await
        .unwrap();

    let broker = AmqpBroker::new(&config).unwrap();
    let mut publisher = broker.publisher().await.unwrap();
    let err = publisher.declare_queue(&queue).await.unwrap_err();
    assert!(matches!(err, QueueError::Declare { .. }), "got {err:?}");
    publisher.close().await.ok();

    delete(&channel, &[&queue]).await;
    connection.close(200, "OK").await.ok();
}
