//! [`BrokerConnection`] and [`BrokerChannel`] on top of [`lapin`]'s `Connection` and `Channel`.
//!
//! [`lapin`]: https://docs.rs/crate/lapin
use crate::amqp::transport::{
    Acknowledge, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, HealthStatus,
    TransportError,
};
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
use std::sync::Arc;

/// Reply code used when we close channels and connections on our own terms.
const REPLY_SUCCESS: u16 = 200;

/// Reply Code 312 - NO_ROUTE
/// See https://www.rabbitmq.com/amqp-0-9-1-reference.html
const NO_ROUTE: u16 = 312;

/// A connection to a RabbitMq broker.
///
/// Connections should re-used across multiple channels given the initial setup cost.
pub struct Connection {
    inner: lapin::Connection,
    publisher_confirms: bool,
}

/// A RabbitMq channel.
pub struct Channel {
    inner: lapin::Channel,
    publisher_confirms: bool,
}

impl Connection {
    pub(crate) fn new(inner: lapin::Connection, publisher_confirms: bool) -> Self {
        Self {
            inner,
            publisher_confirms,
        }
    }
}

#[async_trait::async_trait]
impl BrokerConnection for Connection {
    fn status(&self) -> HealthStatus {
        if self.inner.status().connected() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, TransportError> {
        let channel = self.inner.create_channel().await?;

        if self.publisher_confirms {
            // Enable publish confirms on the channel
            // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }

        Ok(Box::new(Channel {
            inner: channel,
            publisher_confirms: self.publisher_confirms,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "closed by the channel pool")
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BrokerChannel for Channel {
    fn status(&self) -> HealthStatus {
        if self.inner.status().connected() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// Publish a payload on a RabbitMq exchange.
    ///
    /// With publisher confirms enabled, it waits for the broker to confirm the message and
    /// fails if it was nacked or could not be routed.
    #[tracing::instrument(level = "debug", skip(self, payload, properties))]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), TransportError> {
        let options = BasicPublishOptions {
            // This flag tells the server how to react if the message cannot be routed to a queue.
            // If this flag is `true`, the server will return an unroutable message with a Return method.
            // If this flag is `false`, the server silently drops the message.
            mandatory: self.publisher_confirms,
            // The immediate flag was dropped in RabbitMQ 3.0 - see https://www.rabbitmq.com/blog/2012/11/19/breaking-things-with-rabbitmq-3-0/
            // Setting `true` will cause a not-supported error
            immediate: false,
        };
        // Delivery mode: Non-persistent (1) or persistent (2).
        let properties = properties.with_delivery_mode(2);

        let confirm = self
            .inner
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await?
            .await?;

        match confirm {
            Confirmation::Ack(Some(return_message)) if return_message.reply_code == NO_ROUTE => Err(
                TransportError::Unroutable(return_message.reply_text.to_string()),
            ),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack(_) => Err(TransportError::NegativeAck),
        }
    }

    #[tracing::instrument(name = "rabbitmq_declare_exchange", skip(self, arguments))]
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), TransportError> {
        self.inner
            .exchange_declare(exchange, kind, options, arguments)
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_declare_queue", skip(self, arguments))]
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), TransportError> {
        self.inner.queue_declare(queue, options, arguments).await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_bind_queue", skip(self, arguments))]
    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), TransportError> {
        let options = QueueBindOptions { nowait: false };
        self.inner
            .queue_bind(queue, exchange, routing_key, options, arguments)
            .await?;
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_consume", skip(self, arguments))]
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .inner
            .basic_consume(queue, consumer_tag, options, arguments)
            .await?;
        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(Delivery::from)
                    .map_err(TransportError::from)
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "released by the channel pool")
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Acknowledge for Acker {
    async fn ack(&self) -> Result<(), TransportError> {
        Acker::ack(self, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        Acker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        Acker::reject(self, BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Delivery::new(
            value.delivery_tag,
            value.exchange.as_str(),
            value.routing_key.as_str(),
            value.redelivered,
            value.properties,
            value.data,
            Arc::new(value.acker),
        )
    }
}
