use super::connection::ConnectionId;
use super::Shared;
use crate::amqp::{BrokerChannel, HealthStatus};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Identifies a channel for the lifetime of its pool.
pub type ChannelId = u64;

/// A logical channel carved from one of the pool's connections.
pub(crate) struct ChannelBox {
    pub(crate) id: ChannelId,
    pub(crate) connection_id: ConnectionId,
    channel: Box<dyn BrokerChannel>,
    closed: AtomicBool,
}

impl ChannelBox {
    pub(crate) fn new(
        id: ChannelId,
        connection_id: ConnectionId,
        channel: Box<dyn BrokerChannel>,
    ) -> Self {
        Self {
            id,
            connection_id,
            channel,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn inner(&self) -> &(dyn BrokerChannel + 'static) {
        &*self.channel
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// `true` if the channel was flagged as broken or the transport reports it as closed.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.channel.status() == HealthStatus::Unhealthy
    }

    pub(crate) async fn close(&self) {
        self.mark_closed();
        if let Err(e) = self.channel.close().await {
            tracing::debug!(channel_id = self.id, error = %e, "Failed to close channel");
        }
    }
}

impl fmt::Debug for ChannelBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelBox")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// A channel leased from a [`Pool`](super::Pool).
///
/// It dereferences to the underlying [`BrokerChannel`].
/// The channel goes back to the pool when the guard is dropped: use
/// [`PooledChannel::release`] or [`PooledChannel::discard`] to make the intent explicit.
///
/// If an operation on the channel fails because the channel is not open anymore, call
/// [`PooledChannel::mark_broken`] so that it is discarded instead of being handed out again.
pub struct PooledChannel {
    channel: Arc<ChannelBox>,
    pool: Weak<Shared>,
    force_close: bool,
}

impl PooledChannel {
    pub(crate) fn new(channel: Arc<ChannelBox>, pool: Weak<Shared>) -> Self {
        Self {
            channel,
            pool,
            force_close: false,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.channel.id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.channel.connection_id
    }

    /// Flag the channel as unusable: it will be closed on release.
    pub fn mark_broken(&self) {
        self.channel.mark_closed();
    }

    pub fn is_broken(&self) -> bool {
        self.channel.is_closed()
    }

    /// Give the channel back to the pool, to be reused if it is still healthy.
    pub fn release(self) {}

    /// Close the channel and free its slot in the pool.
    pub fn discard(mut self) {
        self.force_close = true;
    }
}

impl Deref for PooledChannel {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.inner()
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        match self.pool.upgrade() {
            Some(pool) => pool.return_channel(Arc::clone(&self.channel), self.force_close),
            None => super::close_in_background(vec![Arc::clone(&self.channel)], Vec::new()),
        }
    }
}

impl fmt::Debug for PooledChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledChannel")
            .field("channel", &self.channel)
            .field("force_close", &self.force_close)
            .finish()
    }
}
