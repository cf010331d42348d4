//! A pool of AMQP channels multiplexed over a small set of broker connections.
//!
//! The pool provides a few key guarantees:
//! - broken channels are disposed of and new ones are created on-demand;
//! - connections are shared across channels, within a per-connection share;
//! - released channels are kept around for reuse, up to a cap and for a limited time;
//! - callers wait a bounded amount of time when every channel is in use.
//!
//! ```rust,no_run
//! use carrot_pool::amqp::configuration::{PoolSettings, RabbitMqSettings};
//! use carrot_pool::amqp::ConnectionFactory;
//! use carrot_pool::pool::{Pool, ServerRegistry};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let settings = RabbitMqSettings::default();
//!     let registry = ServerRegistry::from_settings(&settings)?;
//!     let factory = ConnectionFactory::new_from_config(&settings)?;
//!     let pool = Pool::new(PoolSettings::default(), registry, factory)?;
//!
//!     // Get a channel from the pool and use it.
//!     let channel = pool.get_free_channel().await?;
//!     channel
//!         .publish("", "my-queue", b"hello", Default::default())
//!         .await?;
//!     // Hand it back, it will be reused by the next caller.
//!     channel.release();
//!
//!     pool.close().await;
//!     Ok(())
//! }
//! ```
mod channel;
mod connection;
mod error;
mod maintenance;
mod server;

pub use channel::{ChannelId, PooledChannel};
pub use connection::ConnectionId;
pub use error::Error;
pub use server::{ServerInfo, ServerKey, ServerRegistry, DEFAULT_PORT};

use crate::amqp::configuration::PoolSettings;
use crate::amqp::{BrokerConnection, Connector, TransportError};
use channel::ChannelBox;
use connection::ConnectionBox;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A snapshot of the pool occupancy, see [`Pool::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Channels currently open (or being opened), idle or leased.
    pub live: usize,
    pub idle: usize,
    pub leased: usize,
    pub connections: usize,
    /// How many times a channel has been handed out since the pool was created.
    pub acquisitions: u64,
}

/// A pool of channels spread across the brokers of a [`ServerRegistry`].
///
/// `Pool` is a cheap handle: clone it to share the same pool across tasks.
/// Background tasks reclaim idle channels and, if enabled, probe connections for liveness
/// until [`Pool::close`] is called.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    settings: PoolSettings,
    per_connection: usize,
    registry: ServerRegistry,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    /// Signalled every time a channel goes back to the idle list or a slot is freed.
    available: Notify,
    /// Serialises connection establishment.
    connecting: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct PoolState {
    closed: bool,
    /// Open channels, idle or leased, plus in-flight reservations.
    live: usize,
    /// Most recently released channels at the back.
    idle: VecDeque<IdleChannel>,
    connections: BTreeMap<ConnectionId, ConnectionBox>,
    next_connection_id: ConnectionId,
    next_channel_id: ChannelId,
    /// Round-robin position over the server registry.
    cursor: usize,
    acquisitions: u64,
}

struct IdleChannel {
    channel: Arc<ChannelBox>,
    released_at: Instant,
}

enum Checkout {
    Idle(Arc<ChannelBox>),
    /// A slot was reserved: the caller must open a channel or give the slot back.
    Reserved,
    Exhausted,
}

enum Placement {
    Existing(ConnectionId, Arc<dyn BrokerConnection>),
    /// No connection has room: connect to these servers, in order, until one succeeds.
    Connect(Vec<Arc<ServerInfo>>),
}

/// Resources removed from the pool state, to be closed once the lock is released.
#[derive(Default)]
struct Evicted {
    channels: Vec<Arc<ChannelBox>>,
    connections: Vec<Arc<dyn BrokerConnection>>,
}

impl Evicted {
    fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.connections.is_empty()
    }

    fn close_in_background(self) {
        close_in_background(self.channels, self.connections);
    }
}

impl Pool {
    /// Create a new pool. No connection is opened until the first channel is requested.
    ///
    /// It must be called from within a tokio runtime: the idle channel reaper and the
    /// connection prober are spawned on it.
    pub fn new(
        settings: PoolSettings,
        registry: ServerRegistry,
        connector: impl Connector,
    ) -> Result<Self, Error> {
        Self::with_connector(settings, registry, Arc::new(connector))
    }

    pub fn with_connector(
        settings: PoolSettings,
        registry: ServerRegistry,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, Error> {
        if settings.max_channel_num == 0 {
            return Err(Error::Configuration(anyhow::anyhow!(
                "`max_channel_num` must be greater than zero."
            )));
        }
        if registry.is_empty() {
            return Err(Error::Configuration(anyhow::anyhow!(
                "At least one RabbitMQ server must be configured."
            )));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::Configuration(
                anyhow::Error::new(e).context("The channel pool must be created within a tokio runtime."),
            )
        })?;

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            per_connection: settings.channels_per_connection(registry.len()),
            settings,
            registry,
            connector,
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            connecting: tokio::sync::Mutex::new(()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = vec![runtime.spawn(maintenance::reap_idle_channels(
            Arc::downgrade(&shared),
            shared.shutdown.subscribe(),
            maintenance::reap_period(shared.settings.max_idle_channel_time()),
        ))];
        if let Some(probe_interval) = shared.settings.probe_interval() {
            tasks.push(runtime.spawn(maintenance::probe_connections(
                Arc::downgrade(&shared),
                shared.shutdown.subscribe(),
                probe_interval,
            )));
        }
        *shared.tasks.lock() = tasks;

        Ok(Self { shared })
    }

    /// Lease a channel.
    ///
    /// The most recently released idle channel is reused if it is still usable; otherwise a
    /// new channel is opened, as long as the pool is below `max_channel_num`.
    /// If every channel is in use, it waits up to `max_wait_time` for one to be released
    /// before giving up with [`Error::PoolExhausted`].
    #[tracing::instrument(name = "pool_get_free_channel", level = "debug", skip(self))]
    pub async fn get_free_channel(&self) -> Result<PooledChannel, Error> {
        let max_wait = self.shared.settings.max_wait_time();
        let deadline = Instant::now() + max_wait;
        let mut shutdown = self.shared.shutdown.subscribe();
        loop {
            // Register interest before looking at the state, so that a release happening
            // in between is not missed.
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.shared.checkout()? {
                Checkout::Idle(channel) => return Ok(self.lease(channel)),
                Checkout::Reserved => {
                    let channel = self.shared.open_channel(deadline).await?;
                    return Ok(self.lease(channel));
                }
                Checkout::Exhausted => {}
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(?max_wait, "No channel became available in time");
                    return Err(Error::PoolExhausted(max_wait));
                }
                _ = shutdown.changed() => return Err(Error::Closed),
            }
        }
    }

    /// Give a channel back to the pool.
    ///
    /// With `force_close` set, the channel is closed instead of being kept for reuse.
    pub fn release(&self, channel: PooledChannel, force_close: bool) {
        if force_close {
            channel.discard();
        } else {
            channel.release();
        }
    }

    /// Close the idle channels that have outlived `max_idle_channel_time`.
    ///
    /// It runs periodically in the background; returns the number of channels closed.
    pub fn reap_idle_channels(&self) -> usize {
        self.shared.reap_idle_channels()
    }

    /// Check every healthy connection for liveness, retiring the ones that fail.
    ///
    /// It runs periodically in the background if `probe_interval_ms` is set; returns the
    /// number of connections retired.
    pub async fn probe_connections(&self) -> usize {
        self.shared.probe_connections().await
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.state.lock();
        PoolStatus {
            live: state.live,
            idle: state.idle.len(),
            leased: state.live.saturating_sub(state.idle.len()),
            connections: state.connections.len(),
            acquisitions: state.acquisitions,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.shared.registry
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    /// Shut the pool down.
    ///
    /// Idle channels and connections are closed, background tasks are stopped and callers
    /// waiting for a channel get [`Error::Closed`]. Leased channels are closed when they are
    /// released. Calling `close` more than once is harmless.
    #[tracing::instrument(name = "pool_close", skip(self))]
    pub async fn close(&self) {
        let (channels, connections) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                (Vec::new(), Vec::new())
            } else {
                state.closed = true;
                let channels: Vec<_> = state.idle.drain(..).map(|idle| idle.channel).collect();
                state.live = state.live.saturating_sub(channels.len());
                let connections: Vec<_> = std::mem::take(&mut state.connections)
                    .into_values()
                    .map(|connection| connection.connection)
                    .collect();
                (channels, connections)
            }
        };
        self.shared.shutdown.send_replace(true);
        self.shared.available.notify_waiters();

        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "A background task of the channel pool did not shut down cleanly");
            }
        }

        let n_connections = connections.len();
        close_all(channels, connections).await;
        info!(connections = n_connections, "Channel pool closed");
    }

    fn lease(&self, channel: Arc<ChannelBox>) -> PooledChannel {
        debug!(channel_id = channel.id, "Leased channel");
        PooledChannel::new(channel, Arc::downgrade(&self.shared))
    }
}

impl Shared {
    fn checkout(&self) -> Result<Checkout, Error> {
        let mut evicted = Evicted::default();
        let checkout = {
            let mut state = self.state.lock();
            state.sweep_connections(&mut evicted);
            state.checkout(
                self.settings.max_channel_num,
                self.settings.max_idle_channel_time(),
                &mut evicted,
            )
        };
        if !evicted.is_empty() {
            debug!(
                channels = evicted.channels.len(),
                connections = evicted.connections.len(),
                "Evicted stale channels and dead connections"
            );
            self.available.notify_waiters();
        }
        evicted.close_in_background();
        checkout
    }

    /// Fulfil a slot reserved by [`PoolState::checkout`].
    async fn open_channel(&self, deadline: Instant) -> Result<Arc<ChannelBox>, Error> {
        let mut reservation = Reservation {
            shared: self,
            connection_id: None,
            armed: true,
        };
        let (connection_id, connection) = self.reserve_connection(deadline).await?;
        reservation.connection_id = Some(connection_id);

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(connection_id, error = %e, "Failed to open a channel");
                if e.is_transient() {
                    self.retire_connection(connection_id);
                }
                return Err(Error::from_transport("open channel", e));
            }
        };

        let mut evicted = Evicted::default();
        let opened = {
            let mut state = self.state.lock();
            let id = state.next_channel_id;
            state.next_channel_id += 1;
            let channel = Arc::new(ChannelBox::new(id, connection_id, channel));
            reservation.armed = false;
            if state.closed {
                state.discard(channel, &mut evicted);
                Err(Error::Closed)
            } else {
                state.acquisitions += 1;
                Ok(channel)
            }
        };
        evicted.close_in_background();
        if let Ok(channel) = &opened {
            debug!(channel_id = channel.id, connection_id, "Opened a new channel");
        }
        opened
    }

    /// Pick a connection with room for one more channel, opening a new one if needed.
    ///
    /// On success the channel is already accounted for on the returned connection.
    /// Waiting for another task's connection attempt is bounded by `deadline`; both the wait
    /// and the connection attempt itself are interrupted when the pool is closed.
    async fn reserve_connection(
        &self,
        deadline: Instant,
    ) -> Result<(ConnectionId, Arc<dyn BrokerConnection>), Error> {
        if let Placement::Existing(id, connection) = self.place_channel() {
            return Ok((id, connection));
        }
        let mut shutdown = self.shutdown.subscribe();
        let closed = *shutdown.borrow();
        if closed {
            return Err(Error::Closed);
        }
        let _connecting = tokio::select! {
            guard = self.connecting.lock() => guard,
            _ = tokio::time::sleep_until(deadline) => {
                let max_wait = self.settings.max_wait_time();
                debug!(?max_wait, "Gave up waiting for another connection attempt");
                return Err(Error::PoolExhausted(max_wait));
            }
            _ = shutdown.changed() => return Err(Error::Closed),
        };
        // Another task might have opened a connection with room to spare in the meantime.
        let servers = match self.place_channel() {
            Placement::Existing(id, connection) => return Ok((id, connection)),
            Placement::Connect(servers) => servers,
        };

        let mut last_error = None;
        for server in servers {
            let connected = tokio::select! {
                connected = self.connector.connect(&server) => connected,
                _ = shutdown.changed() => return Err(Error::Closed),
            };
            match connected {
                Ok(connection) => {
                    let id = {
                        let mut state = self.state.lock();
                        (!state.closed).then(|| {
                            state.insert_connection(Arc::clone(&server), Arc::clone(&connection))
                        })
                    };
                    return match id {
                        Some(id) => {
                            info!(%server, connection_id = id, "Opened a new RabbitMQ connection");
                            Ok((id, connection))
                        }
                        None => {
                            close_in_background(Vec::new(), vec![connection]);
                            Err(Error::Closed)
                        }
                    };
                }
                Err(e) => {
                    warn!(%server, error = %e, "Failed to connect to RabbitMQ server");
                    last_error = Some(e);
                }
            }
        }
        Err(match last_error {
            Some(e) => Error::from_transport("open connection", e),
            None => Error::Configuration(anyhow::anyhow!("No RabbitMQ server is configured.")),
        })
    }

    fn place_channel(&self) -> Placement {
        let mut evicted = Evicted::default();
        let placement = {
            let mut state = self.state.lock();
            state.sweep_connections(&mut evicted);
            state.place_channel(&self.registry, self.per_connection)
        };
        evicted.close_in_background();
        placement
    }

    fn return_channel(&self, channel: Arc<ChannelBox>, force_close: bool) {
        let mut evicted = Evicted::default();
        {
            let mut state = self.state.lock();
            let reusable = !force_close
                && !state.closed
                && !channel.is_closed()
                && state.connection_is_healthy(channel.connection_id)
                && state.idle.len() < self.settings.max_idle_channel;
            if reusable {
                state.idle.push_back(IdleChannel {
                    channel,
                    released_at: Instant::now(),
                });
            } else {
                debug!(channel_id = channel.id, force_close, "Closing released channel");
                state.discard(channel, &mut evicted);
            }
        }
        self.available.notify_waiters();
        evicted.close_in_background();
    }

    fn retire_connection(&self, id: ConnectionId) {
        let mut evicted = Evicted::default();
        self.state.lock().retire(id, &mut evicted);
        self.available.notify_waiters();
        evicted.close_in_background();
    }

    fn reap_idle_channels(&self) -> usize {
        let max_idle_time = self.settings.max_idle_channel_time();
        let now = Instant::now();
        let mut evicted = Evicted::default();
        {
            let mut state = self.state.lock();
            state.sweep_connections(&mut evicted);
            for idle in std::mem::take(&mut state.idle) {
                if now.duration_since(idle.released_at) >= max_idle_time || idle.channel.is_closed() {
                    state.discard(idle.channel, &mut evicted);
                } else {
                    state.idle.push_back(idle);
                }
            }
        }
        let reaped = evicted.channels.len();
        if reaped > 0 {
            self.available.notify_waiters();
        }
        evicted.close_in_background();
        reaped
    }

    async fn probe_connections(&self) -> usize {
        let mut evicted = Evicted::default();
        let targets: Vec<_> = {
            let mut state = self.state.lock();
            state.sweep_connections(&mut evicted);
            state
                .connections
                .iter_mut()
                .filter_map(|(id, connection)| {
                    connection.is_healthy().then(|| {
                        (
                            *id,
                            Arc::clone(&connection.server),
                            Arc::clone(&connection.connection),
                        )
                    })
                })
                .collect()
        };
        evicted.close_in_background();
        let timeout = self.settings.probe_timeout();
        let outcomes = join_all(targets.into_iter().map(|(id, server, connection)| async move {
            let outcome = match tokio::time::timeout(timeout, connection.probe()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(TransportError::ConnectionLost(format!(
                    "no answer to the liveness probe within {timeout:?}"
                ))),
            };
            (id, server, outcome)
        }))
        .await;

        let mut retired = 0;
        for (id, server, outcome) in outcomes {
            if let Err(e) = outcome {
                warn!(%server, connection_id = id, error = %e, "RabbitMQ connection failed its liveness probe");
                self.retire_connection(id);
                retired += 1;
            }
        }
        retired
    }
}

impl PoolState {
    fn checkout(
        &mut self,
        max_channels: usize,
        max_idle_time: std::time::Duration,
        evicted: &mut Evicted,
    ) -> Result<Checkout, Error> {
        if self.closed {
            return Err(Error::Closed);
        }
        let now = Instant::now();
        while let Some(idle) = self.idle.pop_back() {
            let fresh = now.duration_since(idle.released_at) < max_idle_time;
            if fresh
                && !idle.channel.is_closed()
                && self.connection_is_healthy(idle.channel.connection_id)
            {
                self.acquisitions += 1;
                return Ok(Checkout::Idle(idle.channel));
            }
            self.discard(idle.channel, evicted);
        }
        if self.live < max_channels {
            self.live += 1;
            return Ok(Checkout::Reserved);
        }
        Ok(Checkout::Exhausted)
    }

    /// Servers are visited round-robin. The first one that is not known to be down gets the
    /// channel: on one of its connections if there is room, on a new connection otherwise.
    fn place_channel(&mut self, registry: &ServerRegistry, share: usize) -> Placement {
        let cursor = self.cursor;
        self.cursor = self.cursor.wrapping_add(1);

        let mut candidates = Vec::with_capacity(registry.len());
        let mut degraded = Vec::new();
        for server in registry.rotation(cursor) {
            let mut has_healthy = false;
            let mut has_unhealthy = false;
            for (id, connection) in self
                .connections
                .iter_mut()
                .filter(|(_, connection)| connection.server.key() == server.key())
            {
                if !connection.is_healthy() {
                    has_unhealthy = true;
                    continue;
                }
                has_healthy = true;
                if candidates.is_empty() && connection.has_spare_share(share) {
                    connection.channels += 1;
                    return Placement::Existing(*id, Arc::clone(&connection.connection));
                }
            }
            if has_unhealthy && !has_healthy {
                degraded.push(Arc::clone(server));
            } else {
                candidates.push(Arc::clone(server));
            }
        }
        candidates.extend(degraded);
        Placement::Connect(candidates)
    }

    fn insert_connection(
        &mut self,
        server: Arc<ServerInfo>,
        connection: Arc<dyn BrokerConnection>,
    ) -> ConnectionId {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        let mut entry = ConnectionBox::new(server, connection);
        entry.channels = 1;
        self.connections.insert(id, entry);
        id
    }

    fn connection_is_healthy(&mut self, id: ConnectionId) -> bool {
        self.connections
            .get_mut(&id)
            .map_or(false, ConnectionBox::is_healthy)
    }

    /// Drop a channel from the books. It must not be in the idle list.
    fn discard(&mut self, channel: Arc<ChannelBox>, evicted: &mut Evicted) {
        self.live = self.live.saturating_sub(1);
        self.detach(channel.connection_id, evicted);
        evicted.channels.push(channel);
    }

    /// Free the share a channel held on its connection.
    fn detach(&mut self, id: ConnectionId, evicted: &mut Evicted) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.channels = connection.channels.saturating_sub(1);
            connection.is_healthy();
        }
        self.remove_if_retired(id, evicted);
    }

    /// Stop allocating on a connection and close its idle channels.
    /// Leased channels stay with their owners until released.
    fn retire(&mut self, id: ConnectionId, evicted: &mut Evicted) {
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        connection.mark_unhealthy();
        for idle in std::mem::take(&mut self.idle) {
            if idle.channel.connection_id == id {
                self.discard(idle.channel, evicted);
            } else {
                self.idle.push_back(idle);
            }
        }
        self.remove_if_retired(id, evicted);
    }

    /// Refresh the health of every connection and tear down the dead ones that carry no
    /// channel anymore. Dead connections with channels go once their last channel is gone.
    fn sweep_connections(&mut self, evicted: &mut Evicted) {
        let retired: Vec<_> = self
            .connections
            .iter_mut()
            .filter_map(|(id, connection)| {
                connection.is_healthy();
                connection.is_retired().then_some(*id)
            })
            .collect();
        for id in retired {
            self.remove_if_retired(id, evicted);
        }
    }

    fn remove_if_retired(&mut self, id: ConnectionId, evicted: &mut Evicted) {
        if self
            .connections
            .get(&id)
            .map_or(false, ConnectionBox::is_retired)
        {
            if let Some(connection) = self.connections.remove(&id) {
                debug!(connection_id = id, server = %connection.server, "Closing retired connection");
                evicted.connections.push(connection.connection);
            }
        }
    }
}

/// A slot (and possibly a connection share) taken for a channel that is still being opened.
/// Both are given back if the channel never materialises.
struct Reservation<'a> {
    shared: &'a Shared,
    connection_id: Option<ConnectionId>,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut evicted = Evicted::default();
        {
            let mut state = self.shared.state.lock();
            state.live = state.live.saturating_sub(1);
            if let Some(id) = self.connection_id {
                state.detach(id, &mut evicted);
            }
        }
        self.shared.available.notify_waiters();
        evicted.close_in_background();
    }
}

/// Close channels, then connections, on the current runtime without waiting for it.
pub(crate) fn close_in_background(
    channels: Vec<Arc<ChannelBox>>,
    connections: Vec<Arc<dyn BrokerConnection>>,
) {
    if channels.is_empty() && connections.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(close_all(channels, connections));
        }
        Err(_) => debug!("No tokio runtime available, dropping channels without closing them"),
    }
}

async fn close_all(channels: Vec<Arc<ChannelBox>>, connections: Vec<Arc<dyn BrokerConnection>>) {
    join_all(channels.iter().map(|channel| channel.close())).await;
    for connection in connections {
        if let Err(e) = connection.close().await {
            debug!(error = %e, "Failed to close connection");
        }
    }
}
