//! # Relay Engine
//!
//! Consumes tag reads from the inbound queue and, for each delivery, walks
//! `Received → Resolved → LookedUp → Published → Acknowledged`:
//!
//! 1. decode and split the body into identifier and cabin,
//! 2. look the identifier up in the record store,
//! 3. publish the formatted payload to `<target>.cabin<cabin>`,
//! 4. acknowledge the delivery.
//!
//! The ack is only sent after the publish succeeded. Any failure before that
//! leaves the delivery unacknowledged (see [`RejectPolicy`]), so the broker
//! can redeliver it: at-least-once, duplicates possible, nothing lost.

pub mod stats;

use std::str::FromStr;
use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broker::{BrokerChannel, BrokerError};
use crate::core::error::RelayError;
use crate::core::message::{Delivery, OutboundMessage};
use crate::core::resolver::resolve;
use crate::core::shutdown;
use crate::store::{lookup_blocking, RecordStore};

pub use stats::{RelayStats, StatsSnapshot};

/// What happens to a delivery that could not be relayed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectPolicy {
    /// Neither ack nor nack; the broker redelivers once the channel closes.
    ///
    /// Needs an unlimited prefetch window. RabbitMQ's `consumer_timeout`
    /// (30 minutes by default) closes a channel that holds an unacked
    /// delivery that long, which ends the consume loop.
    #[default]
    Leave,
    /// Negative-ack with requeue for immediate redelivery.
    Requeue,
    /// Negative-ack without requeue; dead-lettered if the queue has a DLX.
    Discard,
}

impl FromStr for RejectPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "leave" => Ok(RejectPolicy::Leave),
            "requeue" => Ok(RejectPolicy::Requeue),
            "discard" => Ok(RejectPolicy::Discard),
            other => Err(format!("unknown reject policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub inbound_queue: String,
    pub target_queue: String,
    pub exchange: String,
    pub consumer_tag: String,
    pub reject_policy: RejectPolicy,
}

/// Final state of one delivery.
#[derive(Debug)]
pub enum Disposition {
    Acknowledged(OutboundMessage),
    Rejected(RelayError),
}

impl Disposition {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Disposition::Acknowledged(_))
    }
}

pub struct Relay {
    broker: Arc<dyn BrokerChannel>,
    store: Arc<dyn RecordStore>,
    config: RelayConfig,
    stats: RelayStats,
}

impl Relay {
    pub fn new(
        broker: Arc<dyn BrokerChannel>,
        store: Arc<dyn RecordStore>,
        config: RelayConfig,
    ) -> Self {
        Self {
            broker,
            store,
            config,
            stats: RelayStats::new(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Resolve, look up, publish and ack one delivery.
    async fn process(&self, delivery: &Delivery) -> Result<OutboundMessage, RelayError> {
        let inbound = resolve(&delivery.body)?;
        debug!(identifier = %inbound.identifier, cabin = %inbound.cabin_id, "resolved");

        let lookup = lookup_blocking(Arc::clone(&self.store), inbound.identifier.clone()).await?;
        if !lookup.is_found() {
            self.stats.record_not_found();
            debug!(identifier = %inbound.identifier, "no record, publishing sentinel");
        }

        let outbound = OutboundMessage::build(&inbound, &lookup, &self.config.target_queue);
        self.broker
            .publish(
                &self.config.exchange,
                &outbound.destination_topic,
                outbound.payload_bytes(),
            )
            .await
            .map_err(|source| RelayError::Publish {
                routing_key: outbound.destination_topic.clone(),
                source,
            })?;
        self.stats.record_published();

        self.broker
            .ack(delivery.tag)
            .await
            .map_err(|source| RelayError::Ack {
                tag: delivery.tag.value(),
                source,
            })?;
        self.stats.record_acknowledged();

        Ok(outbound)
    }

    /// Relay one delivery. Failures are logged and never propagate, so one
    /// bad message cannot stop the consume loop.
    pub async fn handle(&self, delivery: Delivery) -> Disposition {
        let span = info_span!(
            "relay",
            delivery_tag = delivery.tag.value(),
            redelivered = delivery.redelivered
        );

        async move {
            self.stats.record_received();
            match self.process(&delivery).await {
                Ok(outbound) => {
                    info!(
                        routing_key = %outbound.destination_topic,
                        payload = %outbound.payload,
                        "relayed"
                    );
                    Disposition::Acknowledged(outbound)
                }
                Err(err) => {
                    self.stats.record_rejected();
                    error!(kind = err.kind(), "message rejected: {err}");
                    self.dispose(&delivery, &err).await;
                    Disposition::Rejected(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn dispose(&self, delivery: &Delivery, err: &RelayError) {
        // A failed ack means the channel is already in trouble; the delivery
        // comes back when it closes.
        if matches!(err, RelayError::Ack { .. }) {
            return;
        }
        let requeue = match self.config.reject_policy {
            RejectPolicy::Leave => return,
            RejectPolicy::Requeue => true,
            RejectPolicy::Discard => false,
        };
        if let Err(e) = self.broker.nack(delivery.tag, requeue).await {
            warn!(requeue, "nack failed: {e}");
        }
    }

    /// Consume the inbound queue until `shutdown` fires or the delivery stream
    /// ends.
    ///
    /// A delivery interrupted by shutdown is dropped before its ack. Returns the
    /// final counters on a clean stop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<StatsSnapshot, BrokerError> {
        let mut deliveries = self
            .broker
            .consume(&self.config.inbound_queue, &self.config.consumer_tag)
            .await?;
        info!(
            queue = %self.config.inbound_queue,
            consumer = %self.config.consumer_tag,
            "subscribed, waiting for messages"
        );

        loop {
            if shutdown::is_requested(&shutdown) {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!("delivery stream failed: {e}");
                    return Err(e);
                }
                None => {
                    warn!("delivery stream ended");
                    return Err(BrokerError::ConsumerCancelled(
                        self.config.inbound_queue.clone(),
                    ));
                }
            };

            let tag = delivery.tag;
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    warn!(delivery_tag = tag.value(), "shutdown during processing, delivery left unacknowledged");
                    break;
                }
                _ = self.handle(delivery) => {}
            }
        }

        let snapshot = self.stats();
        info!(%snapshot, "relay stopped");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{BrokerEvent, MemoryBroker, MemoryChannel};
    use crate::broker::DeliveryStream;
    use crate::core::record::{Lookup, Record};
    use crate::store::seed::seed_samples;
    use crate::store::{SqliteRecordStore, StoreError};

    struct FailingStore;

    impl RecordStore for FailingStore {
        fn lookup(&self, _identifier: &str) -> crate::store::error::Result<Lookup> {
            Err(StoreError::LockPoisoned)
        }

        fn insert(&self, _record: &Record) -> crate::store::error::Result<i64> {
            Err(StoreError::LockPoisoned)
        }

        fn count(&self) -> crate::store::error::Result<u64> {
            Err(StoreError::LockPoisoned)
        }
    }

    fn config(policy: RejectPolicy) -> RelayConfig {
        RelayConfig {
            inbound_queue: "test_queue".into(),
            target_queue: "target_queue".into(),
            exchange: "amq.topic".into(),
            consumer_tag: "relay-test".into(),
            reject_policy: policy,
        }
    }

    fn seeded_store() -> Arc<dyn RecordStore> {
        let store = SqliteRecordStore::in_memory().unwrap();
        seed_samples(&store).unwrap();
        Arc::new(store)
    }

    struct Fixture {
        broker: MemoryBroker,
        relay: Relay,
        stream: DeliveryStream,
    }

    async fn fixture(store: Arc<dyn RecordStore>, policy: RejectPolicy) -> Fixture {
        let broker = MemoryBroker::new();
        let channel: Arc<MemoryChannel> = Arc::new(broker.channel());
        channel.declare_queue("test_queue", true).await.unwrap();
        let stream = channel.consume("test_queue", "relay-test").await.unwrap();
        let relay = Relay::new(channel, store, config(policy));
        Fixture {
            broker,
            relay,
            stream,
        }
    }

    impl Fixture {
        async fn deliver(&mut self, body: &[u8]) -> Delivery {
            let producer = self.broker.channel();
            producer.publish("", "test_queue", body).await.unwrap();
            self.stream.next().await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn found_record_is_published_then_acked() {
        let mut fx = fixture(seeded_store(), RejectPolicy::Leave).await;
        let delivery = fx.deliver(b"MERT2025ABCD1234 Cabin 2").await;
        let tag = delivery.tag;

        let disposition = fx.relay.handle(delivery).await;
        assert!(disposition.is_acknowledged());

        let events = fx.broker.events();
        let publish_at = events
            .iter()
            .position(|e| matches!(e, BrokerEvent::Published { routing_key, .. } if routing_key == "target_queue.cabin2"))
            .expect("publish event");
        let ack_at = events
            .iter()
            .position(|e| *e == BrokerEvent::Acked(tag))
            .expect("ack event");
        assert!(publish_at < ack_at);

        let published = fx.broker.published();
        assert_eq!(
            published.last().unwrap(),
            &("target_queue.cabin2".to_string(), "Kot Pantolon:L:Koyu Mavi:3".to_string())
        );
    }

    #[tokio::test]
    async fn unknown_identifier_publishes_sentinel() {
        let mut fx = fixture(seeded_store(), RejectPolicy::Leave).await;
        let delivery = fx.deliver(b"UNKNOWN999").await;

        assert!(fx.relay.handle(delivery).await.is_acknowledged());
        assert_eq!(
            fx.broker.published().last().unwrap(),
            &("target_queue.cabin1".to_string(), "No Data".to_string())
        );
        let stats = fx.relay.stats();
        assert_eq!(stats.not_found, 1);
        assert_eq!(stats.acknowledged, 1);
    }

    #[tokio::test]
    async fn undecodable_body_is_not_acked() {
        let mut fx = fixture(seeded_store(), RejectPolicy::Leave).await;
        let delivery = fx.deliver(&[0xc3, 0x28]).await;

        match fx.relay.handle(delivery).await {
            Disposition::Rejected(RelayError::Decode(_)) => {}
            other => panic!("expected decode rejection, got {other:?}"),
        }
        assert!(fx.broker.published().iter().all(|(k, _)| k == "test_queue"));
        assert_eq!(fx.broker.inflight_count(), 1);
        assert_eq!(fx.relay.stats().rejected, 1);
    }

    #[tokio::test]
    async fn store_fault_rejects_without_publish() {
        let mut fx = fixture(Arc::new(FailingStore), RejectPolicy::Leave).await;
        let delivery = fx.deliver(b"MERT2025ETEK0001 Cabin 5").await;

        let disposition = fx.relay.handle(delivery).await;
        assert!(matches!(disposition, Disposition::Rejected(RelayError::Store(_))));
        assert_eq!(fx.relay.stats().published, 0);
        assert_eq!(fx.broker.inflight_count(), 1);
    }

    #[tokio::test]
    async fn publish_fault_leaves_delivery_unacked() {
        let mut fx = fixture(seeded_store(), RejectPolicy::Leave).await;
        let delivery = fx.deliver(b"MERT2025ETEK0001 Cabin 5").await;
        fx.broker.fail_next_publishes(1);

        let disposition = fx.relay.handle(delivery).await;
        assert!(matches!(disposition, Disposition::Rejected(RelayError::Publish { .. })));
        assert!(!fx
            .broker
            .events()
            .iter()
            .any(|e| matches!(e, BrokerEvent::Acked(_))));
        assert_eq!(fx.broker.inflight_count(), 1);
    }

    #[tokio::test]
    async fn requeue_policy_nacks_for_redelivery() {
        let mut fx = fixture(seeded_store(), RejectPolicy::Requeue).await;
        let delivery = fx.deliver(b"MERT2025ETEK0001 Cabin 5").await;
        let tag = delivery.tag;
        fx.broker.fail_next_publishes(1);

        assert!(!fx.relay.handle(delivery).await.is_acknowledged());
        assert!(fx
            .broker
            .events()
            .contains(&BrokerEvent::Nacked { tag, requeue: true }));

        let retry = fx.stream.next().await.unwrap().unwrap();
        assert!(retry.redelivered);
        assert!(fx.relay.handle(retry).await.is_acknowledged());
        assert_eq!(
            fx.broker.published().last().unwrap(),
            &("target_queue.cabin5".to_string(), "Etek:S:Siyah:10".to_string())
        );
    }

    #[tokio::test]
    async fn discard_policy_nacks_without_requeue() {
        let mut fx = fixture(seeded_store(), RejectPolicy::Discard).await;
        let delivery = fx.deliver(&[0xff]).await;
        let tag = delivery.tag;

        fx.relay.handle(delivery).await;
        assert!(fx
            .broker
            .events()
            .contains(&BrokerEvent::Nacked { tag, requeue: false }));
        assert_eq!(fx.broker.inflight_count(), 0);
        assert_eq!(fx.broker.queue_depth("test_queue"), 0);
    }

    #[tokio::test]
    async fn ack_fault_counts_as_rejection() {
        let mut fx = fixture(seeded_store(), RejectPolicy::Requeue).await;
        let delivery = fx.deliver(b"MERT2025EFGH5678").await;
        fx.broker.fail_next_acks(1);

        let disposition = fx.relay.handle(delivery).await;
        assert!(matches!(disposition, Disposition::Rejected(RelayError::Ack { .. })));
        let stats = fx.relay.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.acknowledged, 0);
        assert_eq!(stats.rejected, 1);
        // No nack after a failed ack.
        assert!(!fx
            .broker
            .events()
            .iter()
            .any(|e| matches!(e, BrokerEvent::Nacked { .. })));
    }

    #[test]
    fn reject_policy_parses() {
        assert_eq!("leave".parse::<RejectPolicy>(), Ok(RejectPolicy::Leave));
        assert_eq!(" Requeue ".parse::<RejectPolicy>(), Ok(RejectPolicy::Requeue));
        assert_eq!("DISCARD".parse::<RejectPolicy>(), Ok(RejectPolicy::Discard));
        assert!("drop".parse::<RejectPolicy>().is_err());
    }
}
