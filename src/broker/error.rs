use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("broker rejected publish to '{routing_key}'")]
    Nacked { routing_key: String },

    #[error("channel is closed")]
    Closed,

    #[error("consumer on '{0}' was cancelled")]
    ConsumerCancelled(String),

    #[error("no queue '{0}'")]
    QueueNotFound(String),

    #[error("no exchange '{0}'")]
    ExchangeNotFound(String),

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}
