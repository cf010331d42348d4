//! Helpers for connecting to RabbitMq brokers.

pub mod configuration;
pub mod convenience;
mod factory;
pub mod rabbit_mq;
pub mod transport;

pub use factory::ConnectionFactory;
pub use transport::{
    Acknowledge, BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream,
    HealthStatus, TransportError,
};

pub use lapin::{options, types, BasicProperties, ExchangeKind};
