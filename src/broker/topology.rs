use tracing::info;

use crate::broker::{is_reserved_exchange, BrokerChannel, BrokerError, ExchangeKind};

/// Names of everything the relay expects to exist on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfig {
    pub inbound_queue: String,
    pub target_queue: String,
    pub exchange: String,
    pub binding_pattern: String,
}

/// Declares queues, exchange and binding before the relay starts consuming.
///
/// Every step is an AMQP declare or bind with fixed arguments, so running
/// [`TopologyManager::ensure`] again leaves the broker unchanged.
#[derive(Debug, Clone)]
pub struct TopologyManager {
    config: TopologyConfig,
}

impl TopologyManager {
    pub fn new(config: TopologyConfig) -> Self {
        Self { config }
    }

    /// Ensure the inbound queue, target queue, topic exchange and the
    /// cabin binding exist. The first failure aborts setup.
    pub async fn ensure(&self, channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
        let cfg = &self.config;

        channel.declare_queue(&cfg.inbound_queue, true).await?;
        channel.declare_queue(&cfg.target_queue, true).await?;

        if is_reserved_exchange(&cfg.exchange) {
            channel
                .check_exchange(&cfg.exchange, ExchangeKind::Topic)
                .await?;
        } else {
            channel
                .declare_exchange(&cfg.exchange, ExchangeKind::Topic, true)
                .await?;
        }

        channel
            .bind_queue(&cfg.target_queue, &cfg.exchange, &cfg.binding_pattern)
            .await?;

        info!(
            inbound = %cfg.inbound_queue,
            target = %cfg.target_queue,
            exchange = %cfg.exchange,
            pattern = %cfg.binding_pattern,
            "broker topology ready"
        );
        Ok(())
    }
}
