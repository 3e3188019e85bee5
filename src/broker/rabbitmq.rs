//! RabbitMQ transport over AMQP 0-9-1.
//!
//! One connection with one channel in publisher-confirm mode. Messages are
//! fetched with `basic.get` without auto-ack and acknowledged by delivery tag,
//! so anything still unacknowledged when the channel closes goes back to the
//! queue.

use super::{Broker, BrokerError, Delivery};
use crate::configuration::SimulationConfig;
use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicPublishOptions, ConfirmSelectOptions,
    QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

const REPLY_SUCCESS: u16 = 200;

struct Session {
    connection: Connection,
    channel: Channel,
}

pub struct RabbitMqBroker {
    uri: AMQPUri,
    session: Mutex<Option<Session>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Broker-side refusals (unknown queue, mismatched declaration) are the
/// caller's arguments at fault; everything else is the transport.
fn classify(e: lapin::Error) -> BrokerError {
    match e {
        lapin::Error::ProtocolError(amqp) => BrokerError::InvalidArgument(amqp.to_string()),
        e => BrokerError::Transport(e.to_string()),
    }
}

fn amqp_uri(config: &SimulationConfig) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.authority.host = config.host.clone();
    uri.authority.port = config.port;
    uri.authority.userinfo.username = config.username.clone();
    uri.authority.userinfo.password = config.password.clone();
    uri.vhost = config.vhost.clone();
    uri
}

impl RabbitMqBroker {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            uri: amqp_uri(config),
            session: Mutex::new(None),
        }
    }

    fn channel(&self) -> Result<Channel, BrokerError> {
        lock(&self.session)
            .as_ref()
            .map(|session| session.channel.clone())
            .ok_or(BrokerError::Closed)
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let unreachable = |e: lapin::Error| BrokerError::Unreachable(e.to_string());
        let connection = Connection::connect_uri(self.uri.clone(), ConnectionProperties::default())
            .await
            .map_err(unreachable)?;
        let channel = connection.create_channel().await.map_err(unreachable)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(classify)?;
        debug!(
            "Opened AMQP channel {} on {}:{}",
            channel.id(),
            self.uri.authority.host,
            self.uri.authority.port
        );

        let previous = lock(&self.session).replace(Session {
            connection,
            channel,
        });
        if let Some(previous) = previous {
            if let Err(e) = previous.connection.close(REPLY_SUCCESS, "reconnect").await {
                debug!("Closing previous connection failed: {e}");
            }
        }
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.channel()?
            .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<(), BrokerError> {
        let confirmation = self
            .channel()?
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                body,
                BasicProperties::default().with_content_type(content_type.to_string().into()),
            )
            .await
            .map_err(classify)?
            .await
            .map_err(classify)?;

        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(_)) => Err(BrokerError::InvalidArgument(format!(
                "message was not routed to queue '{queue}'"
            ))),
            Confirmation::Nack(_) => Err(BrokerError::InvalidArgument(format!(
                "broker refused message for queue '{queue}'"
            ))),
        }
    }

    async fn poll(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let message = self
            .channel()?
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(classify)?;
        Ok(message.map(|message| Delivery {
            delivery_tag: message.delivery.delivery_tag,
            redelivered: message.delivery.redelivered,
            body: message.delivery.data,
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel()?
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(classify)
    }

    async fn purge(&self, queue: &str) -> Result<u32, BrokerError> {
        self.channel()?
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(classify)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let Some(session) = lock(&self.session).take() else {
            return Ok(());
        };
        if let Err(e) = session.channel.close(REPLY_SUCCESS, "bye").await {
            debug!("Closing channel failed: {e}");
        }
        session
            .connection
            .close(REPLY_SUCCESS, "bye")
            .await
            .map_err(classify)
    }
}
