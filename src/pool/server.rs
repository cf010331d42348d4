//! The brokers a [`Pool`](super::Pool) spreads its connections across.
use crate::amqp::configuration::RabbitMqSettings;
use anyhow::Context;
use std::fmt;
use std::sync::Arc;

/// Port used when an endpoint does not specify one.
pub const DEFAULT_PORT: u16 = 5672;

/// Index of a [`ServerInfo`] inside its [`ServerRegistry`].
pub type ServerKey = usize;

/// A broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    key: ServerKey,
    host: String,
    port: u16,
    identity: String,
}

impl ServerInfo {
    pub fn key(&self) -> ServerKey {
        self.key
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `user@host:port/vhost`, used to name connections and in logs.
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity)
    }
}

/// The immutable set of broker endpoints known to a pool.
#[derive(Debug, Clone)]
pub struct ServerRegistry {
    servers: Vec<Arc<ServerInfo>>,
}

impl ServerRegistry {
    /// Parse a list of `host[:port]` endpoints.
    ///
    /// Fails if the list is empty or if a port is not a valid number.
    pub fn new<S: AsRef<str>>(
        addresses: &[S],
        username: &str,
        vhost: &str,
    ) -> Result<Self, anyhow::Error> {
        if addresses.is_empty() {
            anyhow::bail!("At least one RabbitMQ server must be configured.");
        }
        let servers = addresses
            .iter()
            .enumerate()
            .map(|(key, address)| {
                let (host, port) = parse_address(address.as_ref())?;
                let identity = format!("{username}@{host}:{port}{vhost}");
                Ok(Arc::new(ServerInfo {
                    key,
                    host,
                    port,
                    identity,
                }))
            })
            .collect::<Result<Vec<_>, anyhow::Error>>()?;
        Ok(Self { servers })
    }

    pub fn from_settings(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        Self::new(settings.servers.as_slice(), &settings.username, &settings.vhost)
    }

    pub fn get(&self, key: ServerKey) -> Option<&Arc<ServerInfo>> {
        self.servers.get(key)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServerInfo>> {
        self.servers.iter()
    }

    /// The order in which servers should be tried, starting at `cursor` and wrapping around.
    pub(crate) fn rotation(&self, cursor: usize) -> impl Iterator<Item = &Arc<ServerInfo>> {
        let start = cursor % self.servers.len().max(1);
        self.servers[start..].iter().chain(&self.servers[..start])
    }
}

fn parse_address(address: &str) -> Result<(String, u16), anyhow::Error> {
    let address = address.trim();
    match address.rsplit_once(':') {
        // A bare IPv6 address has colons but no port.
        Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
            let port = port
                .parse()
                .with_context(|| format!("Invalid port in RabbitMQ server address `{address}`."))?;
            Ok((host.to_owned(), port))
        }
        _ if address.is_empty() => anyhow::bail!("RabbitMQ server addresses cannot be empty."),
        _ => Ok((address.to_owned(), DEFAULT_PORT)),
    }
}
