use thiserror::Error;

use crate::broker::BrokerError;
use crate::store::StoreError;

/// Inbound body could not be decoded as text.
#[derive(Debug, Error)]
#[error("inbound body is not valid utf-8: {0}")]
pub struct DecodeError(#[from] pub std::str::Utf8Error);

/// Per-message failure. Each variant leaves the delivery unacknowledged.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("store lookup failed: {0}")]
    Store(#[from] StoreError),

    #[error("publish to '{routing_key}' failed: {source}")]
    Publish {
        routing_key: String,
        #[source]
        source: BrokerError,
    },

    #[error("ack of delivery {tag} failed: {source}")]
    Ack {
        tag: u64,
        #[source]
        source: BrokerError,
    },
}

impl RelayError {
    /// Short label used in logs and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Decode(_) => "decode",
            RelayError::Store(_) => "store",
            RelayError::Publish { .. } => "publish",
            RelayError::Ack { .. } => "ack",
        }
    }
}

/// Anything that stops the daemon before the consume loop starts.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("broker connection failed: {0}")]
    Connect(#[source] BrokerError),

    #[error("topology setup failed: {0}")]
    Topology(#[source] BrokerError),

    #[error("record store unavailable: {0}")]
    Store(#[from] StoreError),
}
