//! A high-level interface to publish and consume messages through a channel [`Pool`].
//!
//! Every operation follows the same pattern: lease a channel, perform the protocol call,
//! give the channel back. Channels that failed because they were not open anymore are
//! discarded rather than handed to the next caller.
mod consumer;
mod data;

pub use consumer::ConsumerHandle;
pub use data::{
    ConsumeData, ExchangeData, PublishData, RabbitHeaders, LOG_ID_HEADER, OP_UID_HEADER,
    SERVICE_HEADER,
};

use crate::amqp::configuration::ClientSettings;
use crate::amqp::convenience::string_headers;
use crate::amqp::options::{BasicConsumeOptions, QueueDeclareOptions};
use crate::amqp::types::FieldTable;
use crate::amqp::{BasicProperties, Connector, ConnectionFactory, Delivery, ExchangeKind};
use crate::pool::{Error, Pool, PooledChannel, ServerRegistry};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use uuid::Uuid;

/// A publish that failed because its channel was not open is attempted once more
/// on a fresh channel.
const MAX_PUBLISH_ATTEMPTS: usize = 2;

const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Publishes, consumes and declares topology over a shared channel [`Pool`].
///
/// `Client` is a cheap handle: clone it to share the same pool across tasks.
///
/// # Example
///
/// ```rust,no_run
/// use carrot_pool::amqp::configuration::ClientSettings;
/// use carrot_pool::client::{Client, PublishData};
///
/// async fn example() -> anyhow::Result<()> {
///     let client = Client::from_settings(ClientSettings::default())?;
///
///     let message = PublishData::new("order.created", r#"{"id": 42}"#)
///         .with_content_type("application/json");
///     client.publish(&message, "request-1234").await?;
///
///     client.close().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    pool: Pool,
    exchange_name: String,
    exchange_type: String,
    service_name: String,
}

impl Client {
    /// Build a client talking to RabbitMq with `lapin`.
    ///
    /// Connections are opened lazily, on the first operation that needs a channel.
    pub fn from_settings(settings: ClientSettings) -> Result<Self, Error> {
        let factory =
            ConnectionFactory::new_from_config(&settings.rabbit_mq).map_err(Error::Configuration)?;
        Self::with_connector(settings, factory)
    }

    /// Build a client on top of a custom [`Connector`].
    pub fn with_connector(
        settings: ClientSettings,
        connector: impl Connector,
    ) -> Result<Self, Error> {
        let registry =
            ServerRegistry::from_settings(&settings.rabbit_mq).map_err(Error::Configuration)?;
        let pool = Pool::new(settings.pool, registry, connector)?;
        Ok(Self {
            pool,
            exchange_name: settings.exchange_name,
            exchange_type: settings.exchange_type,
            service_name: settings.service_name,
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Publish a message, using its op code as routing key.
    ///
    /// `Ok(())` means the message was handed to the broker (and confirmed, with publisher
    /// confirms enabled). If the channel turns out not to be open, the message is published
    /// once more on a fresh channel; a second failure of the same kind is returned as
    /// [`Error::TransientTransport`].
    #[tracing::instrument(name = "rabbitmq_publish", skip_all, fields(op_code = %message.op_code, log_id = %log_id))]
    pub async fn publish(&self, message: &PublishData, log_id: &str) -> Result<(), Error> {
        if message.op_code.is_empty() {
            return Err(Error::Validation(
                "the op code of a message cannot be empty".into(),
            ));
        }
        if message.data.is_empty() {
            return Err(Error::Validation(
                "the payload of a message cannot be empty".into(),
            ));
        }

        let exchange = self.exchange_name(message.exchange.as_ref());
        let properties = self.properties(message, log_id);
        let mut attempt = 1;
        loop {
            let channel = self.pool.get_free_channel().await?;
            let published = channel
                .publish(exchange, &message.op_code, &message.data, properties.clone())
                .await;
            match published {
                Ok(()) => {
                    channel.release();
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    channel.discard();
                    if attempt >= MAX_PUBLISH_ATTEMPTS {
                        return Err(Error::from_transport("publish", e));
                    }
                    warn!(attempt, error = %e, "Channel was not open, publishing again on a new channel");
                    attempt += 1;
                }
                Err(e) => {
                    channel.release();
                    return Err(Error::from_transport("publish", e));
                }
            }
        }
    }

    /// Start consuming from a queue.
    ///
    /// The exchange and the queue (durable) are declared, the queue is bound to the exchange
    /// once per op code and the prefetch limit is applied before consuming.
    #[tracing::instrument(name = "rabbitmq_consume", skip_all, fields(queue = %request.queue_name))]
    pub async fn consume(&self, request: &ConsumeData) -> Result<ConsumerHandle, Error> {
        let channel = self.pool.get_free_channel().await?;
        let consumer_tag = if request.name.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            request.name.clone()
        };

        let started = async {
            self.prepare_queue(&channel, request).await?;
            channel
                .basic_qos(request.limit)
                .await
                .map_err(|e| Error::from_transport("set qos", e))?;
            let options = BasicConsumeOptions {
                no_local: false,
                no_ack: request.auto_ack,
                exclusive: request.exclusive,
                nowait: request.no_wait,
            };
            channel
                .basic_consume(
                    &request.queue_name,
                    &consumer_tag,
                    options,
                    FieldTable::default(),
                )
                .await
                .map_err(|e| Error::from_transport("consume", e))
        }
        .await;

        match started {
            Ok(deliveries) => {
                info!(%consumer_tag, "Started consuming");
                Ok(ConsumerHandle::new(
                    request.queue_name.clone(),
                    consumer_tag,
                    deliveries,
                    channel,
                ))
            }
            Err(e) => {
                // A failed declaration closes the channel on the broker side.
                channel.discard();
                Err(e)
            }
        }
    }

    /// Declare an exchange, falling back to the default exchange for `None` or empty fields.
    ///
    /// Declaring an exchange that already exists with the same arguments is a no-op;
    /// declaring it with different arguments fails with [`Error::Protocol`].
    #[tracing::instrument(name = "rabbitmq_declare_exchange", skip_all)]
    pub async fn declare_exchange(&self, exchange: Option<&ExchangeData>) -> Result<(), Error> {
        let channel = self.pool.get_free_channel().await?;
        match self.exchange_declare(&channel, exchange).await {
            Ok(()) => {
                channel.release();
                Ok(())
            }
            Err(e) => {
                channel.discard();
                Err(e)
            }
        }
    }

    /// Lease a raw channel from the pool.
    ///
    /// The channel goes back to the pool when the guard is dropped.
    pub async fn acquire_channel(&self) -> Result<PooledChannel, Error> {
        self.pool.get_free_channel().await
    }

    /// Extract the routing information and the headers set by [`Client::publish`].
    pub fn decode_headers(delivery: &Delivery) -> RabbitHeaders {
        RabbitHeaders::from(delivery)
    }

    /// Close the underlying pool. See [`Pool::close`].
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn prepare_queue(
        &self,
        channel: &PooledChannel,
        request: &ConsumeData,
    ) -> Result<(), Error> {
        self.exchange_declare(channel, request.exchange.as_ref())
            .await?;

        let options = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };
        channel
            .queue_declare(&request.queue_name, options, FieldTable::default())
            .await
            .map_err(|e| Error::from_transport("declare queue", e))?;

        let exchange = self.exchange_name(request.exchange.as_ref());
        for op_code in &request.op_codes {
            channel
                .queue_bind(&request.queue_name, exchange, op_code, FieldTable::default())
                .await
                .map_err(|e| Error::from_transport("bind queue", e))?;
        }
        Ok(())
    }

    async fn exchange_declare(
        &self,
        channel: &PooledChannel,
        exchange: Option<&ExchangeData>,
    ) -> Result<(), Error> {
        let name = self.exchange_name(exchange);
        let kind = exchange_kind(
            exchange
                .map(|exchange| exchange.kind.as_str())
                .filter(|kind| !kind.is_empty())
                .unwrap_or(&self.exchange_type),
        );
        let (options, arguments) = match exchange {
            Some(exchange) => (exchange.declare_options(), exchange.arguments.clone()),
            None => (
                ExchangeData::default().declare_options(),
                FieldTable::default(),
            ),
        };
        channel
            .exchange_declare(name, kind, options, arguments)
            .await
            .map_err(|e| Error::from_transport("declare exchange", e))
    }

    fn exchange_name<'a>(&'a self, exchange: Option<&'a ExchangeData>) -> &'a str {
        exchange
            .map(|exchange| exchange.name.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.exchange_name)
    }

    fn properties(&self, message: &PublishData, log_id: &str) -> BasicProperties {
        let service = message
            .service_name
            .as_deref()
            .filter(|service| !service.is_empty())
            .unwrap_or(&self.service_name);
        let content_type = message
            .content_type
            .as_deref()
            .filter(|content_type| !content_type.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        let headers = string_headers([
            (LOG_ID_HEADER, log_id),
            (SERVICE_HEADER, service),
            (OP_UID_HEADER, message.op_uid.as_str()),
        ]);

        let properties = BasicProperties::default()
            .with_content_type(content_type.into())
            .with_headers(headers)
            .with_message_id(Uuid::new_v4().to_string().into());
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(now) => properties.with_timestamp(now.as_secs()),
            Err(_) => {
                warn!("System time is before 1970");
                properties
            }
        }
    }
}

/// Map an exchange type name to its AMQP counterpart.
fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        custom => ExchangeKind::Custom(custom.to_owned()),
    }
}
