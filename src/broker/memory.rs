//! In-process broker following AMQP 0-9-1 rules closely enough to exercise
//! the relay without RabbitMQ.
//!
//! - The default exchange (`""`) routes to the queue named by the routing key.
//! - Topic exchanges match dot-separated words, `*` for exactly one word and
//!   `#` for zero or more.
//! - Deliveries stay in-flight until acked; nack with requeue and channel close
//!   put them back at the head of their queue marked as redelivered.
//! - `amq.direct`, `amq.fanout` and `amq.topic` exist from the start.
//!
//! Every publish, ack and nack is appended to an event log so tests can check
//! ordering.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::broker::{is_reserved_exchange, BrokerChannel, BrokerError, DeliveryStream, ExchangeKind};
use crate::core::message::{Delivery, DeliveryTag};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Published {
        exchange: String,
        routing_key: String,
        payload: Bytes,
        routed_to: Vec<String>,
    },
    Acked(DeliveryTag),
    Nacked {
        tag: DeliveryTag,
        requeue: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub pattern: String,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    routing_key: String,
    body: Bytes,
    redelivered: bool,
}

#[derive(Debug)]
struct ConsumerSlot {
    channel_id: u64,
    tag: String,
    sender: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

#[derive(Debug)]
struct QueueState {
    durable: bool,
    pending: VecDeque<QueuedMessage>,
    consumers: Vec<ConsumerSlot>,
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<Binding>,
}

#[derive(Debug)]
struct InflightEntry {
    channel_id: u64,
    queue: String,
    message: QueuedMessage,
}

#[derive(Debug, Default)]
struct FaultPlan {
    publish: u32,
    ack: u32,
    declare: u32,
}

impl FaultPlan {
    fn take(counter: &mut u32, what: &str) -> Result<(), BrokerError> {
        if *counter > 0 {
            *counter -= 1;
            return Err(BrokerError::Unavailable(format!("injected {what} failure")));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
    inflight: HashMap<DeliveryTag, InflightEntry>,
    next_tag: u64,
    events: Vec<BrokerEvent>,
    faults: FaultPlan,
}

impl BrokerState {
    fn new() -> Self {
        let mut exchanges = HashMap::new();
        for (name, kind) in [
            ("amq.direct", ExchangeKind::Direct),
            ("amq.fanout", ExchangeKind::Fanout),
            ("amq.topic", ExchangeKind::Topic),
        ] {
            exchanges.insert(
                name.to_string(),
                ExchangeState {
                    kind,
                    durable: true,
                    bindings: Vec::new(),
                },
            );
        }
        Self {
            queues: HashMap::new(),
            exchanges,
            inflight: HashMap::new(),
            next_tag: 1,
            events: Vec::new(),
            faults: FaultPlan::default(),
        }
    }

    /// Hand pending messages of `queue` to its first live consumer.
    fn dispatch(&mut self, queue: &str) {
        let BrokerState {
            queues,
            inflight,
            next_tag,
            ..
        } = self;
        let Some(state) = queues.get_mut(queue) else {
            return;
        };

        loop {
            state.consumers.retain(|slot| !slot.sender.is_closed());
            let Some(slot) = state.consumers.first() else {
                break;
            };
            let Some(message) = state.pending.pop_front() else {
                break;
            };

            let tag = DeliveryTag::from_raw(*next_tag);
            *next_tag = next_tag.wrapping_add(1);

            let delivery = Delivery {
                tag,
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                body: message.body.clone(),
            };

            if slot.sender.unbounded_send(Ok(delivery)).is_err() {
                // Receiver dropped between the retain and the send.
                state.pending.push_front(message);
                continue;
            }

            trace!(queue, consumer = %slot.tag, tag = tag.value(), "delivered");
            inflight.insert(
                tag,
                InflightEntry {
                    channel_id: slot.channel_id,
                    queue: queue.to_string(),
                    message,
                },
            );
        }
    }

    fn enqueue(&mut self, queue: &str, message: QueuedMessage, front: bool) {
        if let Some(state) = self.queues.get_mut(queue) {
            if front {
                state.pending.push_front(message);
            } else {
                state.pending.push_back(message);
            }
        }
        self.dispatch(queue);
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let state = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in &state.bindings {
            let hit = match state.kind {
                ExchangeKind::Direct => binding.pattern == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.pattern, routing_key),
            };
            if hit && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    /// Return every in-flight delivery of `channel_id` to its queue.
    fn release_channel(&mut self, channel_id: u64) {
        let mut tags: Vec<DeliveryTag> = self
            .inflight
            .iter()
            .filter(|(_, entry)| entry.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        // Newest first so the oldest ends up at the head of the queue.
        tags.sort_unstable_by(|a, b| b.cmp(a));

        for state in self.queues.values_mut() {
            state.consumers.retain(|slot| slot.channel_id != channel_id);
        }

        let mut touched: Vec<String> = Vec::new();
        for tag in tags {
            if let Some(mut entry) = self.inflight.remove(&tag) {
                entry.message.redelivered = true;
                if let Some(state) = self.queues.get_mut(&entry.queue) {
                    state.pending.push_front(entry.message);
                }
                if !touched.contains(&entry.queue) {
                    touched.push(entry.queue);
                }
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }
}

/// Match an AMQP topic binding `pattern` against `key`.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && match_words(rest, tail),
            None => false,
        },
    }
}

/// Shared in-process broker. Cloning yields another handle to the same broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_channel: Arc<AtomicU64>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new())),
            next_channel: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a new channel on this broker.
    pub fn channel(&self) -> MemoryChannel {
        MemoryChannel {
            id: self.next_channel.fetch_add(1, Ordering::Relaxed),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }
    }

    /// Make the next `n` publishes fail with [`BrokerError::Unavailable`].
    pub fn fail_next_publishes(&self, n: u32) {
        self.state.lock().faults.publish = n;
    }

    pub fn fail_next_acks(&self, n: u32) {
        self.state.lock().faults.ack = n;
    }

    /// Make the next `n` declare/bind calls fail.
    pub fn fail_next_declares(&self, n: u32) {
        self.state.lock().faults.declare = n;
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.state.lock().events.clone()
    }

    /// `(routing_key, payload)` of every accepted publish, oldest first.
    pub fn published(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                BrokerEvent::Published {
                    routing_key,
                    payload,
                    ..
                } => Some((
                    routing_key.clone(),
                    String::from_utf8_lossy(payload).into_owned(),
                )),
                _ => None,
            })
            .collect()
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn queue_durable(&self, name: &str) -> Option<bool> {
        self.state.lock().queues.get(name).map(|q| q.durable)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages waiting in `queue` (not counting in-flight deliveries).
    pub fn queue_depth(&self, name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(name)
            .map_or(0, |q| q.pending.len())
    }

    /// Payloads waiting in `queue`, head first.
    pub fn queued_payloads(&self, name: &str) -> Vec<Bytes> {
        self.state
            .lock()
            .queues
            .get(name)
            .map(|q| q.pending.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn inflight_count(&self) -> usize {
        self.state.lock().inflight.len()
    }

    pub fn bindings(&self, exchange: &str) -> Vec<Binding> {
        self.state
            .lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.state.lock().exchanges.get(name).map(|e| e.kind)
    }
}

/// One channel on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    closed: AtomicBool,
}

impl MemoryChannel {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.lock().release_channel(self.id);
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        FaultPlan::take(&mut state.faults.declare, "declare")?;

        if let Some(existing) = state.queues.get(name) {
            if existing.durable != durable {
                return Err(BrokerError::PreconditionFailed(format!(
                    "queue '{name}' exists with durable={}",
                    existing.durable
                )));
            }
            return Ok(());
        }

        state.queues.insert(
            name.to_string(),
            QueueState {
                durable,
                pending: VecDeque::new(),
                consumers: Vec::new(),
            },
        );
        debug!(queue = name, durable, "queue created");
        Ok(())
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        FaultPlan::take(&mut state.faults.declare, "declare")?;

        match state.exchanges.get(name) {
            Some(existing) if existing.kind == kind && existing.durable == durable => Ok(()),
            Some(existing) => Err(BrokerError::PreconditionFailed(format!(
                "exchange '{name}' exists as {} durable={}",
                existing.kind.as_str(),
                existing.durable
            ))),
            None if is_reserved_exchange(name) => Err(BrokerError::PreconditionFailed(format!(
                "exchange name '{name}' is reserved"
            ))),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        durable,
                        bindings: Vec::new(),
                    },
                );
                debug!(exchange = name, kind = kind.as_str(), "exchange created");
                Ok(())
            }
        }
    }

    async fn check_exchange(&self, name: &str, _kind: ExchangeKind) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        FaultPlan::take(&mut state.faults.declare, "declare")?;
        if state.exchanges.contains_key(name) {
            Ok(())
        } else {
            Err(BrokerError::ExchangeNotFound(name.to_string()))
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        FaultPlan::take(&mut state.faults.declare, "bind")?;

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;

        let binding = Binding {
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
            debug!(queue, exchange, pattern, "binding created");
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded();
        {
            let mut state = self.state.lock();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            q.consumers.push(ConsumerSlot {
                channel_id: self.id,
                tag: consumer_tag.to_string(),
                sender: tx,
            });
            state.dispatch(queue);
        }
        Ok(rx.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        FaultPlan::take(&mut state.faults.publish, "publish")?;

        let routed_to = state.route(exchange, routing_key)?;
        let body = Bytes::copy_from_slice(payload);
        for queue in &routed_to {
            let message = QueuedMessage {
                routing_key: routing_key.to_string(),
                body: body.clone(),
                redelivered: false,
            };
            state.enqueue(queue, message, false);
        }
        if routed_to.is_empty() {
            debug!(exchange, routing_key, "publish matched no binding");
        }
        state.events.push(BrokerEvent::Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: body,
            routed_to,
        });
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        FaultPlan::take(&mut state.faults.ack, "ack")?;

        match state.inflight.get(&tag) {
            Some(entry) if entry.channel_id == self.id => {
                state.inflight.remove(&tag);
                state.events.push(BrokerEvent::Acked(tag));
                Ok(())
            }
            _ => Err(BrokerError::UnknownDeliveryTag(tag.value())),
        }
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state.lock();

        let entry = match state.inflight.get(&tag) {
            Some(entry) if entry.channel_id == self.id => state.inflight.remove(&tag),
            _ => None,
        };
        let Some(mut entry) = entry else {
            return Err(BrokerError::UnknownDeliveryTag(tag.value()));
        };

        state.events.push(BrokerEvent::Nacked { tag, requeue });
        if requeue {
            entry.message.redelivered = true;
            state.enqueue(&entry.queue, entry.message, true);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.lock().release_channel(self.id);
        debug!(channel_id = self.id, "channel closed");
        Ok(())
    }
}
