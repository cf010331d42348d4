//! `carrot-pool` multiplexes many AMQP channels over a handful of RabbitMQ connections,
//! built on top of [`lapin`].
//!
//! [`Pool`](crate::pool::Pool) hands out channels, reuses the idle ones, discards the broken
//! ones and keeps the number of connections and channels bounded.
//! [`Client`](crate::client::Client) is a thin layer on top of it to publish messages,
//! consume queues and declare exchanges, retrying publishes that hit a channel which was
//! not open anymore.
//!
//! The broker is reached through the traits in [`amqp::transport`]:
//! [`ConnectionFactory`](crate::amqp::ConnectionFactory) implements them for RabbitMQ.

pub mod amqp;
pub mod client;
pub mod pool;
