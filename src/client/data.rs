//! Request and response types of the [`Client`](super::Client).
use crate::amqp::convenience::BasicPropertiesExt;
use crate::amqp::options::ExchangeDeclareOptions;
use crate::amqp::types::FieldTable;
use crate::amqp::Delivery;
use amq_protocol_types::Timestamp;

/// Header carrying the correlation identifier of a message.
pub const LOG_ID_HEADER: &str = "logId";
/// Header carrying the name of the service that published a message.
pub const SERVICE_HEADER: &str = "service";
/// Header carrying the identity of the operator behind a message.
pub const OP_UID_HEADER: &str = "opUid";

/// A message to publish.
///
/// The op code is used as routing key.
#[derive(Debug, Clone, Default)]
pub struct PublishData {
    pub op_code: String,
    pub data: Vec<u8>,
    /// Where to publish. The client's default exchange is used if `None`.
    pub exchange: Option<ExchangeData>,
    /// Defaults to `text/plain`.
    pub content_type: Option<String>,
    /// Overrides the `service` header, which defaults to the configured service name.
    pub service_name: Option<String>,
    pub op_uid: String,
}

impl PublishData {
    pub fn new(op_code: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            op_code: op_code.into(),
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_exchange(mut self, exchange: ExchangeData) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn with_op_uid(mut self, op_uid: impl Into<String>) -> Self {
        self.op_uid = op_uid.into();
        self
    }
}

/// What to consume and how.
///
/// The queue is declared as durable and bound to the exchange once per op code.
#[derive(Debug, Clone, Default)]
pub struct ConsumeData {
    pub queue_name: String,
    pub op_codes: Vec<String>,
    /// The exchange the queue is bound to. The client's default exchange is used if `None`.
    pub exchange: Option<ExchangeData>,
    /// Prefetch count: how many unacknowledged messages the broker pushes at once.
    /// `0` means no limit.
    pub limit: u16,
    /// Consumer tag. A random one is generated if left empty.
    pub name: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_wait: bool,
}

impl ConsumeData {
    pub fn new<I, S>(queue_name: impl Into<String>, op_codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue_name: queue_name.into(),
            op_codes: op_codes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_exchange(mut self, exchange: ExchangeData) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn with_limit(mut self, limit: u16) -> Self {
        self.limit = limit;
        self
    }
}

/// An exchange declaration.
///
/// An empty `name` or `kind` falls back to the client defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeData {
    pub name: String,
    /// `direct`, `fanout`, `topic`, `headers` or a custom exchange type.
    pub kind: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub arguments: FieldTable,
}

impl Default for ExchangeData {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: String::new(),
            durable: true,
            auto_delete: false,
            internal: false,
            no_wait: false,
            arguments: FieldTable::default(),
        }
    }
}

impl ExchangeData {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub(crate) fn declare_options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: false,
            durable: self.durable,
            auto_delete: self.auto_delete,
            internal: self.internal,
            nowait: self.no_wait,
        }
    }
}

/// The routing information and headers of a received message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RabbitHeaders {
    pub exchange: String,
    pub route_key: String,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<Timestamp>,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub log_id: String,
    pub service: String,
    pub op_uid: String,
}

impl From<&Delivery> for RabbitHeaders {
    fn from(delivery: &Delivery) -> Self {
        let properties = &delivery.properties;
        let header = |name: &str| {
            properties
                .get_header_str(name)
                .map(|value| value.into_owned())
                .unwrap_or_default()
        };
        Self {
            exchange: delivery.exchange.clone(),
            route_key: delivery.routing_key.clone(),
            timestamp: *properties.timestamp(),
            message_id: properties.message_id().as_ref().map(|id| id.to_string()),
            content_type: properties.content_type().as_ref().map(|ct| ct.to_string()),
            log_id: header(LOG_ID_HEADER),
            service: header(SERVICE_HEADER),
            op_uid: header(OP_UID_HEADER),
        }
    }
}
