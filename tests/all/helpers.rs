//! An in-memory broker implementing the transport traits, with knobs to inject failures.
use async_trait::async_trait;
use carrot_pool::amqp::configuration::{ClientSettings, PoolSettings};
use carrot_pool::amqp::options::{BasicConsumeOptions, ExchangeDeclareOptions, QueueDeclareOptions};
use carrot_pool::amqp::types::FieldTable;
use carrot_pool::amqp::{
    Acknowledge, BasicProperties, BrokerChannel, BrokerConnection, Connector, Delivery,
    DeliveryStream, ExchangeKind, HealthStatus, TransportError,
};
use carrot_pool::client::Client;
use carrot_pool::pool::{Pool, ServerInfo, ServerRegistry};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const NOT_OPEN: &str = "Exception (504) Reason: \"channel/connection is not open\"";

pub fn pool_settings() -> PoolSettings {
    PoolSettings {
        max_channel_num: 10,
        max_channels_per_connection: None,
        max_idle_channel: 10,
        max_idle_channel_time_ms: 10_000,
        probe_interval_ms: 0,
        probe_timeout_ms: 500,
        max_wait_time_ms: 50,
    }
}

pub fn registry(servers: &[&str]) -> ServerRegistry {
    ServerRegistry::new(servers, "guest", "/").unwrap()
}

pub fn get_pool(settings: PoolSettings) -> (Pool, MockBroker) {
    get_pool_with_servers(settings, &["rabbit-1"])
}

pub fn get_pool_with_servers(settings: PoolSettings, servers: &[&str]) -> (Pool, MockBroker) {
    let broker = MockBroker::default();
    let pool = Pool::new(settings, registry(servers), broker.connector()).unwrap();
    (pool, broker)
}

pub fn get_client(pool: PoolSettings) -> (Client, MockBroker) {
    let settings = ClientSettings {
        pool,
        ..ClientSettings::default()
    };
    let broker = MockBroker::default();
    let client = Client::with_connector(settings, broker.connector()).unwrap();
    (client, broker)
}

/// Give spawned tasks (e.g. channels being closed in the background) a chance to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[derive(Debug, Clone)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
}

#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    connections: Vec<Arc<ConnectionState>>,
    channels_opened: usize,
    channels_closed: usize,
    publish_failures: VecDeque<String>,
    refused_hosts: HashSet<String>,
    hanging_connections: bool,
    failing_probes: bool,
    exchanges: HashMap<String, (ExchangeKind, bool)>,
    queues: HashMap<String, Queue>,
    published: Vec<Published>,
    prefetch: Option<u16>,
    next_delivery_tag: u64,
}

#[derive(Default)]
struct Queue {
    bindings: Vec<(String, String)>,
    consumers: Vec<(String, mpsc::UnboundedSender<Delivery>)>,
}

struct ConnectionState {
    host: String,
    alive: AtomicBool,
}

impl MockBroker {
    pub fn connector(&self) -> MockConnector {
        MockConnector {
            broker: self.clone(),
        }
    }

    pub fn connections_opened(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// The host of every connection ever opened, in order.
    pub fn connected_hosts(&self) -> Vec<String> {
        self.state
            .lock()
            .connections
            .iter()
            .map(|connection| connection.host.clone())
            .collect()
    }

    pub fn channels_opened(&self) -> usize {
        self.state.lock().channels_opened
    }

    pub fn channels_closed(&self) -> usize {
        self.state.lock().channels_closed
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().published.clone()
    }

    /// The next `n` publishes fail with `message`, closing their channel.
    pub fn fail_next_publishes(&self, n: usize, message: &str) {
        let mut state = self.state.lock();
        for _ in 0..n {
            state.publish_failures.push_back(message.to_owned());
        }
    }

    pub fn refuse_connections_to(&self, host: &str) {
        self.state.lock().refused_hosts.insert(host.to_owned());
    }

    /// Connection attempts never complete, as with a broker that accepts TCP but never
    /// answers the AMQP handshake.
    pub fn hang_connections(&self, hanging: bool) {
        self.state.lock().hanging_connections = hanging;
    }

    pub fn fail_probes(&self, failing: bool) {
        self.state.lock().failing_probes = failing;
    }

    /// Drop every open connection, as a broker restart would.
    pub fn kill_connections(&self) {
        for connection in &self.state.lock().connections {
            connection.alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn exchange(&self, name: &str) -> Option<(ExchangeKind, bool)> {
        self.state.lock().exchanges.get(name).cloned()
    }

    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|queue| queue.bindings.clone())
            .unwrap_or_default()
    }

    pub fn consumers(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.consumers.len())
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.state.lock().prefetch
    }
}

pub struct MockConnector {
    broker: MockBroker,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        server: &ServerInfo,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let hanging = self.broker.state.lock().hanging_connections;
        if hanging {
            std::future::pending::<()>().await;
        }
        let mut state = self.broker.state.lock();
        if state.refused_hosts.contains(server.host()) {
            return Err(TransportError::ConnectionLost(format!(
                "connection refused by {}",
                server.address()
            )));
        }
        let connection = Arc::new(ConnectionState {
            host: server.host().to_owned(),
            alive: AtomicBool::new(true),
        });
        state.connections.push(Arc::clone(&connection));
        Ok(Arc::new(MockConnection {
            broker: self.broker.clone(),
            state: connection,
        }))
    }
}

struct MockConnection {
    broker: MockBroker,
    state: Arc<ConnectionState>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    fn status(&self) -> HealthStatus {
        if self.state.alive.load(Ordering::SeqCst) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, TransportError> {
        if self.status() == HealthStatus::Unhealthy {
            return Err(TransportError::ConnectionLost("connection is closed".into()));
        }
        self.broker.state.lock().channels_opened += 1;
        Ok(Box::new(MockChannel {
            broker: self.broker.clone(),
            connection: Arc::clone(&self.state),
            open: AtomicBool::new(true),
        }))
    }

    async fn probe(&self) -> Result<(), TransportError> {
        if self.broker.state.lock().failing_probes {
            return Err(TransportError::ConnectionLost("missed heartbeats".into()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MockChannel {
    broker: MockBroker,
    connection: Arc<ConnectionState>,
    open: AtomicBool,
}

impl MockChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection.alive.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::from_message(NOT_OPEN))
        }
    }

    /// Brokers close the channel on which an operation failed.
    fn fail(&self, message: String) -> TransportError {
        self.open.store(false, Ordering::SeqCst);
        TransportError::from_message(message)
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    fn status(&self) -> HealthStatus {
        if self.is_open() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut guard = self.broker.state.lock();
        let state = &mut *guard;
        if let Some(message) = state.publish_failures.pop_front() {
            return Err(self.fail(message));
        }
        state.published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
            properties: properties.clone(),
        });

        let binding = (exchange.to_owned(), routing_key.to_owned());
        for queue in state.queues.values() {
            if !queue.bindings.contains(&binding) {
                continue;
            }
            if let Some((_, consumer)) = queue.consumers.first() {
                state.next_delivery_tag += 1;
                let _ = consumer.send(Delivery::new(
                    state.next_delivery_tag,
                    exchange,
                    routing_key,
                    false,
                    properties.clone(),
                    payload.to_vec(),
                    Arc::new(NoopAcker),
                ));
            }
        }
        Ok(())
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        let conflict = state
            .exchanges
            .get(exchange)
            .map(|(existing, durable)| *existing != kind || *durable != options.durable);
        match conflict {
            Some(true) => Err(self.fail(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for exchange '{exchange}' in vhost '/'"
            ))),
            Some(false) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(exchange.to_owned(), (kind, options.durable));
                Ok(())
            }
        }
    }

    async fn queue_declare(
        &self,
        queue: &str,
        _options: QueueDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker
            .state
            .lock()
            .queues
            .entry(queue.to_owned())
            .or_default();
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut guard = self.broker.state.lock();
        let state = &mut *guard;
        if !state.exchanges.contains_key(exchange) {
            return Err(self.fail(format!("NOT_FOUND - no exchange '{exchange}' in vhost '/'")));
        }
        match state.queues.get_mut(queue) {
            Some(queue) => {
                queue
                    .bindings
                    .push((exchange.to_owned(), routing_key.to_owned()));
                Ok(())
            }
            None => Err(self.fail(format!("NOT_FOUND - no queue '{queue}' in vhost '/'"))),
        }
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker.state.lock().prefetch = Some(prefetch_count);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _options: BasicConsumeOptions,
        _arguments: FieldTable,
    ) -> Result<DeliveryStream, TransportError> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        match self.broker.state.lock().queues.get_mut(queue) {
            Some(queue) => queue.consumers.push((consumer_tag.to_owned(), sender)),
            None => return Err(self.fail(format!("NOT_FOUND - no queue '{queue}' in vhost '/'"))),
        }
        let deliveries = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|delivery| (Ok::<_, TransportError>(delivery), receiver))
        });
        Ok(deliveries.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        for queue in self.broker.state.lock().queues.values_mut() {
            queue.consumers.retain(|(tag, _)| tag != consumer_tag);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.state.lock().channels_closed += 1;
        }
        Ok(())
    }
}

struct NoopAcker;

#[async_trait]
impl Acknowledge for NoopAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<(), TransportError> {
        Ok(())
    }

    async fn reject(&self, _requeue: bool) -> Result<(), TransportError> {
        Ok(())
    }
}
