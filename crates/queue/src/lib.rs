pub mod amqp;
pub mod broker;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod publisher;

pub use amqp::AmqpBroker;
pub use broker::Broker;
pub use consumer::{dead_letter_queue, Delivery, QueueConsumer};
pub use error::QueueError;
pub use memory::MemoryBroker;
pub use publisher::QueuePublisher;
