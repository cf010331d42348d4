//! The seam between the channel pool and the broker.
//!
//! The pool never talks to [`lapin`] directly: connections and channels are reached
//! through [`Connector`], [`BrokerConnection`] and [`BrokerChannel`].
//! [`ConnectionFactory`](crate::amqp::ConnectionFactory) is the RabbitMq implementation
//! of this interface, but any type implementing these traits can be plugged into a
//! [`Pool`](crate::pool::Pool) - e.g. an in-memory broker in tests.
use crate::pool::ServerInfo;
use amq_protocol_types::DeliveryTag;
use futures_util::stream::BoxStream;
use lapin::options::{BasicConsumeOptions, ExchangeDeclareOptions, QueueDeclareOptions};
use lapin::protocol::{AMQPErrorKind, AMQPHardError};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};
use std::fmt;
use std::sync::Arc;

/// Error signatures reported by brokers when an operation is attempted on a channel
/// (or connection) that is no longer open.
const NOT_OPEN_SIGNATURES: [&str; 3] = [
    "channel/connection is not open",
    "CHANNEL_ERROR - expected 'channel.open'",
    "CHANNEL-ERROR",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// The stream of messages pushed by the broker to a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Error returned by the transport when interacting with the broker.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The channel or the connection it was carved from is not open anymore.
    ///
    /// Retrying on a fresh channel might succeed.
    #[error("channel/connection is not open: {0}")]
    NotOpen(String),
    /// The broker refused the operation - e.g. an exchange was redeclared with
    /// different arguments.
    #[error("the broker rejected the operation: {0}")]
    Protocol(String),
    /// The underlying connection is gone: I/O failure, missed heartbeats, forced close.
    #[error("the connection to the broker was lost: {0}")]
    ConnectionLost(String),
    /// The broker nacked a message published in confirm mode.
    #[error("the broker nacked the publishing of the message")]
    NegativeAck,
    /// A message published with the mandatory flag could not be routed to any queue.
    #[error("the message could not be routed: {0}")]
    Unroutable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransportError {
    /// Classify an error message using the signatures brokers use to report
    /// operations on a closed channel or connection.
    ///
    /// Messages without a known signature are treated as protocol errors.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if NOT_OPEN_SIGNATURES
            .iter()
            .any(|signature| message.contains(signature))
        {
            Self::NotOpen(message)
        } else {
            Self::Protocol(message)
        }
    }

    /// `true` if the channel or connection was not open when the operation was attempted.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotOpen(_) | Self::ConnectionLost(_))
    }
}

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::InvalidChannel(_) => Self::NotOpen(err.to_string()),
            lapin::Error::ProtocolError(amqp_error) => match amqp_error.kind() {
                AMQPErrorKind::Soft(_) => Self::Protocol(err.to_string()),
                AMQPErrorKind::Hard(AMQPHardError::CHANNELERROR) => {
                    Self::NotOpen(err.to_string())
                }
                AMQPErrorKind::Hard(_) => Self::ConnectionLost(err.to_string()),
            },
            lapin::Error::IOError(_) | lapin::Error::MissingHeartbeatError => {
                Self::ConnectionLost(err.to_string())
            }
            _ => Self::Other(err.into()),
        }
    }
}

/// Opens connections to the endpoints held by a [`ServerRegistry`](crate::pool::ServerRegistry).
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a new physical connection to `server`.
    async fn connect(&self, server: &ServerInfo)
        -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

/// A physical connection to a broker, shared by all the channels carved from it.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    fn status(&self) -> HealthStatus;

    /// Open a new logical channel on this connection.
    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, TransportError>;

    /// A lightweight liveness check, independent of application traffic.
    ///
    /// By default it opens and immediately closes a throwaway channel.
    async fn probe(&self) -> Result<(), TransportError> {
        if self.status() == HealthStatus::Unhealthy {
            return Err(TransportError::ConnectionLost(
                "connection reported as not connected".into(),
            ));
        }
        let channel = self.create_channel().await?;
        channel.close().await
    }

    async fn close(&self) -> Result<(), TransportError>;
}

/// A logical channel multiplexed over a [`BrokerConnection`].
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    fn status(&self) -> HealthStatus;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), TransportError>;

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), TransportError>;

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), TransportError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), TransportError>;

    /// Limit the number of unacknowledged messages pushed to consumers on this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<DeliveryStream, TransportError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Settles a delivery with the broker.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), TransportError>;
    async fn nack(&self, requeue: bool) -> Result<(), TransportError>;
    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;
}

/// A message received from a queue.
pub struct Delivery {
    /// The delivery tag of the message.
    pub delivery_tag: DeliveryTag,
    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: String,
    /// The routing key of the message.
    pub routing_key: String,
    /// Whether this message was redelivered
    pub redelivered: bool,
    /// Contains the properties and the headers of the message.
    pub properties: BasicProperties,
    /// The payload of the message in binary format.
    pub data: Vec<u8>,
    acker: Arc<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        delivery_tag: DeliveryTag,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        properties: BasicProperties,
        data: Vec<u8>,
        acker: Arc<dyn Acknowledge>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            properties,
            data,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker.nack(requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("data", &self.data)
            .finish()
    }
}
