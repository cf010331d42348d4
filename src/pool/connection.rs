use super::server::ServerInfo;
use crate::amqp::{BrokerConnection, HealthStatus};
use std::sync::Arc;

/// Identifies a [`ConnectionBox`] inside the pool's connection table.
pub type ConnectionId = u64;

/// One physical connection to a broker and the bookkeeping for the channels carved from it.
pub(crate) struct ConnectionBox {
    pub(crate) server: Arc<ServerInfo>,
    pub(crate) connection: Arc<dyn BrokerConnection>,
    /// Live channels opened on this connection, idle or leased, including in-flight reservations.
    pub(crate) channels: usize,
    healthy: bool,
}

impl ConnectionBox {
    pub(crate) fn new(server: Arc<ServerInfo>, connection: Arc<dyn BrokerConnection>) -> Self {
        Self {
            server,
            connection,
            channels: 0,
            healthy: true,
        }
    }

    /// Whether the connection can still carry new channels.
    ///
    /// Once a connection has been found unhealthy it never becomes healthy again.
    pub(crate) fn is_healthy(&mut self) -> bool {
        if self.healthy && self.connection.status() == HealthStatus::Unhealthy {
            tracing::warn!(server = %self.server, "RabbitMQ connection is not connected anymore");
            self.healthy = false;
        }
        self.healthy
    }

    pub(crate) fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub(crate) fn has_spare_share(&mut self, share: usize) -> bool {
        self.is_healthy() && self.channels < share
    }

    /// An unhealthy connection with no channel left can be torn down.
    pub(crate) fn is_retired(&self) -> bool {
        !self.healthy && self.channels == 0
    }
}
