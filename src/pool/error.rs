use crate::amqp::TransportError;
use std::time::Duration;

/// Error returned by the [`Pool`](super::Pool) and by the operations built on top of it.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The request was rejected before touching the pool.
    #[error("invalid request: {0}")]
    Validation(String),
    /// No channel became available within the configured wait time.
    #[error("no channel became available within {0:?}")]
    PoolExhausted(Duration),
    /// The pool has been shut down.
    #[error("the channel pool has been closed")]
    Closed,
    /// The channel or its connection was not open when the operation was attempted.
    #[error("{operation}: {source}")]
    TransientTransport {
        operation: &'static str,
        #[source]
        source: TransportError,
    },
    /// The broker refused the operation.
    #[error("{operation}: {source}")]
    Protocol {
        operation: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("{operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("invalid configuration: {0:#}")]
    Configuration(anyhow::Error),
}

impl Error {
    /// Label a transport failure with the operation that triggered it.
    pub fn from_transport(operation: &'static str, source: TransportError) -> Self {
        match source {
            TransportError::NotOpen(_) | TransportError::ConnectionLost(_) => {
                Self::TransientTransport { operation, source }
            }
            TransportError::Protocol(_)
            | TransportError::NegativeAck
            | TransportError::Unroutable(_) => Self::Protocol { operation, source },
            TransportError::Other(_) => Self::Transport { operation, source },
        }
    }

    /// `true` if retrying on a fresh channel might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientTransport { .. })
    }
}
