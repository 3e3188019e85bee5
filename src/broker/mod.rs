//! Transport seam between the [`QueueClient`](crate::queue_client::QueueClient)
//! and a message broker.
//!
//! A [`Broker`] value represents one connection (and its channel). The client
//! owns it exclusively and shares it only with its own consumer worker.

pub mod management;
pub mod memory;
pub mod rabbitmq;

use async_trait::async_trait;
use thiserror::Error;

pub use management::ManagementApiBroker;
pub use memory::MemoryBroker;
pub use rabbitmq::RabbitMqBroker;

/// Content type attached to every published body.
pub const CONTENT_TYPE: &str = "text/plain";

/// A message handed out by [`Broker::poll`], unacknowledged until
/// [`Broker::ack`] is called with its tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker host could not be reached or refused the login.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The broker rejected the arguments of a request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation needing an open connection ran without one.
    #[error("connection is closed")]
    Closed,

    /// Any other failure reported by the transport.
    #[error("broker failure: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Opens the connection and a channel on it.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Declares `queue`, creating it if it does not exist.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, body: &[u8], content_type: &str)
        -> Result<(), BrokerError>;

    /// Fetches at most one message without auto-acknowledgement.
    async fn poll(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Drops every ready message in `queue`, returning how many were removed.
    async fn purge(&self, queue: &str) -> Result<u32, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    /// Whether a fetched message is already settled by the broker, making
    /// [`Broker::ack`] a no-op and delivery at-most-once.
    fn settles_on_fetch(&self) -> bool {
        false
    }
}
