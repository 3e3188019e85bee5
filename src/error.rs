use crate::broker::BrokerError;
use crate::message::MalformedMessage;
use thiserror::Error;

/// Failures surfaced by [`QueueClient`](crate::queue_client::QueueClient).
///
/// Lifecycle violations (`NotConnected`, `AlreadyConsuming`, `NotConsuming`)
/// are caller bugs; connectivity failures are left to the caller to retry.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("could not connect to the broker: {0}")]
    Connection(#[source] BrokerError),

    #[error("connected, but could not set up queue '{queue}': {source}")]
    QueueConnection {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("client is not connected")]
    NotConnected,

    #[error("could not publish message: {0}")]
    Publish(#[source] BrokerError),

    #[error("client is already consuming")]
    AlreadyConsuming,

    #[error("client is not consuming")]
    NotConsuming,

    #[error(transparent)]
    MalformedMessage(#[from] MalformedMessage),

    /// The broker failed while the consume loop was polling or acknowledging.
    #[error("consume loop aborted: {0}")]
    Consume(#[source] BrokerError),

    /// The message handler failed; the in-flight message was not acknowledged.
    #[error("message handler failed: {0:#}")]
    Handler(anyhow::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
