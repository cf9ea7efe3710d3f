//! # Broker Module
//!
//! The relay and the topology manager talk to the message broker through
//! [`BrokerChannel`], a narrow async view of one AMQP channel.
//!
//! - `amqp`: production channel backed by `lapin` (RabbitMQ, AMQP 0-9-1).
//! - `memory`: in-process broker with the same routing and ack rules, used by
//!   tests and local dry runs.
//! - `topology`: declares the queues, exchange and binding the relay needs.

pub mod amqp;
pub mod error;
pub mod memory;
pub mod topology;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::core::message::{Delivery, DeliveryTag};

pub use self::amqp::AmqpSession;
pub use self::error::BrokerError;
pub use self::memory::{MemoryBroker, MemoryChannel};
pub use self::topology::{TopologyConfig, TopologyManager};

/// Stream of deliveries produced by [`BrokerChannel::consume`]. It ends when
/// the consumer is cancelled or the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

/// Operations the relay needs from one broker channel.
///
/// Publish and ack go through the same channel, so implementations serialise
/// them per connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError>;

    /// Passive declare: succeeds only if the exchange already exists.
    async fn check_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str)
        -> Result<(), BrokerError>;

    /// Subscribe to `queue` with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    /// Publish and wait until the broker has taken responsibility for the message.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8])
        -> Result<(), BrokerError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    /// Close the channel (and its connection, if owned). Unacknowledged
    /// deliveries return to their queues.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Names under `amq.` belong to the broker and may only be declared passively.
pub fn is_reserved_exchange(name: &str) -> bool {
    name.starts_with("amq.")
}
