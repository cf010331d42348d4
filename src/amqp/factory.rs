use crate::amqp::configuration::RabbitMqSettings;
use crate::amqp::rabbit_mq::Connection;
use crate::amqp::transport::{BrokerConnection, Connector, TransportError};
use crate::pool::ServerInfo;
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

#[derive(Clone)]
/// All the information required to connect to the RabbitMq brokers of a
/// [`ServerRegistry`](crate::pool::ServerRegistry).
///
/// `ConnectionFactory` is the production [`Connector`]: it opens `lapin` connections, plain
/// or encrypted, and hands them to the pool.
pub struct ConnectionFactory {
    settings: RabbitMqSettings,
    /// The timeout observed when trying to connect to RabbitMq.
    connection_timeout: Duration,
    /// TLS configuration for the connections to RabbitMq.
    /// If `None`, the connections will not be encrypted.
    tls: Option<Arc<Tls>>,
}

struct Tls {
    connector: NativeTlsConnector,
    /// Overrides the host of each server as the expected CN on its certificate.
    domain_name: Option<String>,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// A connection timeout can be (optionally) specified in `settings`.
    /// If the connection timeout is left unspecified, it will be defaulted to 10 seconds.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let tls = settings
            .tls
            .as_ref()
            .map::<Result<Tls, anyhow::Error>, _>(|tls_settings| {
                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }
                if let Some(identity) = tls_settings.client_identity()? {
                    connector_builder.identity(identity);
                }

                let connector = connector_builder
                    .build()
                    .context("TLS configuration for RabbitMQ failed")?;
                Ok(Tls {
                    domain_name: tls_settings.domain.clone(),
                    connector,
                })
            })
            .transpose()?;
        let connection_timeout = settings
            .connection_timeout()
            .unwrap_or_else(|| Duration::from_secs(10));
        Ok(Self {
            settings: settings.clone(),
            connection_timeout,
            tls: tls.map(Arc::new),
        })
    }

    /// Create a new connection to a RabbitMq broker.
    ///
    /// It establishes an encrypted connection if `self.tls` is `Some`.
    /// It establishes an unencrypted connection if `self.tls` is `None`.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self), fields(server = %server.identity()))]
    pub async fn new_connection(&self, server: &ServerInfo) -> Result<Connection, anyhow::Error> {
        let uri = self.settings.amqp_uri(server.host(), server.port());
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_connection_name(server.identity().into());
        let connection = match &self.tls {
            None => self.connect_without_tls(uri, properties).await,
            Some(tls) => {
                self.connect_with_tls(uri, properties, Arc::clone(tls))
                    .await
            }
        }?;
        // Register a callback to log connection errors.
        let identity = server.identity().to_owned();
        connection.on_error(move |e| {
            warn!(server = %identity, "RabbitMQ broken connection: {:?}", e);
        });
        Ok(Connection::new(connection, self.settings.publisher_confirms))
    }

    /// Establish a new unencrypted connection to a RabbitMq broker.
    async fn connect_without_tls(
        &self,
        uri: AMQPUri,
        properties: ConnectionProperties,
    ) -> Result<lapin::Connection, anyhow::Error> {
        match timeout(
            self.connection_timeout,
            lapin::Connection::connect_uri(uri, properties),
        )
        .await
        {
            Ok(result) => result.context("Failed to connect to RabbitMQ."),
            Err(_) => Err(anyhow::anyhow!(
                "Timed out while trying to connect to RabbitMQ."
            )),
        }
    }

    /// Establish a new TLS connection to a RabbitMq broker.
    async fn connect_with_tls(
        &self,
        uri: AMQPUri,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, anyhow::Error> {
        let domain_name = tls_configuration
            .domain_name
            .clone()
            .unwrap_or_else(|| uri.authority.host.clone());
        match timeout(
            self.connection_timeout,
            lapin::Connection::connector(
                uri,
                Box::new(move |uri| {
                    // First establish a plain TCP connection using the AMQP protocol
                    let mut amqp_uri = uri.clone();
                    amqp_uri.scheme = AMQPScheme::AMQP;
                    amqp_uri
                        .connect()
                        // Then perform a TLS handshake with custom settings
                        // including customisation of the expected domain for the server certificate
                        .and_then(|tcp| {
                            tcp.into_native_tls(&tls_configuration.connector, &domain_name)
                        })
                }),
                properties,
            ),
        )
        .await
        {
            Ok(result) => result.context("Failed to establish a TLS connection to RabbitMQ."),
            Err(_) => Err(anyhow::anyhow!(
                "Timed out while trying to establish a TLS connection to RabbitMQ."
            )),
        }
    }
}

#[async_trait::async_trait]
impl Connector for ConnectionFactory {
    async fn connect(
        &self,
        server: &ServerInfo,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let connection = self
            .new_connection(server)
            .await
            .map_err(|e| TransportError::ConnectionLost(format!("{e:#}")))?;
        Ok(Arc::new(connection))
    }
}
