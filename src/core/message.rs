use bytes::Bytes;

use crate::core::record::Lookup;
use crate::core::resolver::destination_topic;

/// Broker-assigned handle identifying one delivery on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn value(self) -> u64 {
        self.0
    }

    pub fn from_raw(value: u64) -> Self {
        DeliveryTag(value)
    }
}

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to the relay by a broker consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Bytes,
}

/// A tag read after decoding and splitting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub raw_body: Bytes,
    pub identifier: String,
    pub cabin_id: String,
}

impl InboundMessage {
    pub fn destination_topic(&self, target: &str) -> String {
        destination_topic(target, &self.cabin_id)
    }
}

/// What the relay publishes for one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub destination_topic: String,
    pub payload: String,
}

impl OutboundMessage {
    pub fn build(inbound: &InboundMessage, lookup: &Lookup, target: &str) -> Self {
        Self {
            destination_topic: inbound.destination_topic(target),
            payload: lookup.payload(),
        }
    }

    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_bytes()
    }
}
