//! RabbitMQ channel over AMQP 0-9-1.
//!
//! One [`AmqpSession`] owns one connection and one channel. The channel runs
//! in publisher-confirm mode so `publish` only returns `Ok` once the broker has
//! confirmed the message.

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info, warn};

use crate::broker::{BrokerChannel, BrokerError, DeliveryStream, ExchangeKind};
use crate::core::message::{Delivery, DeliveryTag};

const REPLY_SUCCESS: u16 = 200;

pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

impl AmqpSession {
    /// Connect to `uri`, open a channel and enable publisher confirms.
    ///
    /// `prefetch == 0` leaves the broker's unlimited default in place. If the
    /// channel cannot be set up, the connection is closed before returning.
    pub async fn connect(uri: &str, prefetch: u16) -> Result<Self, BrokerError> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        let connection = Connection::connect(uri, properties).await?;

        let setup = open_channel(&connection, prefetch).await;
        let channel = release_on_error(setup, async {
            connection
                .close(REPLY_SUCCESS, "channel setup failed")
                .await
                .map_err(BrokerError::from)
        })
        .await?;

        info!(channel_id = channel.id(), prefetch, "AMQP channel open");
        Ok(Self {
            connection,
            channel,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

async fn open_channel(connection: &Connection, prefetch: u16) -> Result<Channel, BrokerError> {
    let channel = connection.create_channel().await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;
    if prefetch > 0 {
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
    }
    Ok(channel)
}

/// Run `release` only when `result` is an error. The original error wins.
async fn release_on_error<T, R>(result: Result<T, BrokerError>, release: R) -> Result<T, BrokerError>
where
    R: Future<Output = Result<(), BrokerError>>,
{
    if result.is_err() {
        if let Err(e) = release.await {
            warn!("releasing connection after failed setup: {e}");
        }
    }
    result
}

/// Close the channel, then the connection, even if the first step fails.
/// Returns the first error.
async fn close_in_order<C, K>(channel: C, connection: K) -> Result<(), BrokerError>
where
    C: Future<Output = Result<(), BrokerError>>,
    K: Future<Output = Result<(), BrokerError>>,
{
    let channel_result = channel.await;
    if let Err(e) = &channel_result {
        warn!("channel close failed, closing connection anyway: {e}");
    }
    let connection_result = connection.await;
    channel_result.and(connection_result)
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

fn to_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        tag: DeliveryTag::from_raw(delivery.delivery_tag),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        body: Bytes::from(delivery.data),
    }
}

#[async_trait]
impl BrokerChannel for AmqpSession {
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable,
            ..Default::default()
        };
        let queue = self
            .channel
            .queue_declare(name, options, FieldTable::default())
            .await?;
        debug!(queue = name, messages = queue.message_count(), "queue declared");
        Ok(())
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            durable,
            ..Default::default()
        };
        self.channel
            .exchange_declare(name, kind.into(), options, FieldTable::default())
            .await?;
        debug!(exchange = name, kind = kind.as_str(), "exchange declared");
        Ok(())
    }

    async fn check_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            passive: true,
            ..Default::default()
        };
        self.channel
            .exchange_declare(name, kind.into(), options, FieldTable::default())
            .await?;
        debug!(exchange = name, "exchange present");
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        debug!(queue, exchange, pattern, "queue bound");
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(consumer
            .map(|item| item.map(to_delivery).map_err(BrokerError::from))
            .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await?
            .await?;
        if confirm.is_nack() {
            return Err(BrokerError::Nacked {
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(tag.value(), BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let options = BasicNackOptions {
            requeue,
            ..Default::default()
        };
        self.channel.basic_nack(tag.value(), options).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let channel = async {
            if self.channel.status().connected() {
                self.channel.close(REPLY_SUCCESS, "relay shutting down").await?;
            }
            Ok::<(), BrokerError>(())
        };
        let connection = async {
            if self.is_connected() {
                self.connection
                    .close(REPLY_SUCCESS, "relay shutting down")
                    .await?;
            }
            Ok::<(), BrokerError>(())
        };
        close_in_order(channel, connection).await?;
        info!("AMQP connection closed");
        Ok(())
    }
}
