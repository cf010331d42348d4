//! Reading and writing the string headers attached to messages.
use amq_protocol_types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use std::borrow::{Borrow, Cow};

/// Header lookups on [`lapin::BasicProperties`].
pub trait BasicPropertiesExt {
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized;

    /// Lookup a header string value.
    ///
    /// Returns `None` if the header is missing or not a string.
    fn get_header_str<Q>(&self, key: &Q) -> Option<Cow<'_, str>>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        match self.get_header(key)? {
            AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes())),
            AMQPValue::ShortString(s) => Some(Cow::Borrowed(s.as_str())),
            _ => None,
        }
    }
}

impl BasicPropertiesExt for BasicProperties {
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        self.headers().as_ref()?.inner().get(key)
    }
}

/// Build a header table out of `(name, value)` pairs.
///
/// Pairs with an empty value are skipped: the header is not sent at all.
///
/// # Example
///
/// ```rust
/// use carrot_pool::amqp::BasicProperties;
/// use carrot_pool::amqp::convenience::{string_headers, BasicPropertiesExt};
///
/// let headers = string_headers([("logId", "request-1234"), ("opUid", "")]);
/// let properties = BasicProperties::default().with_headers(headers);
///
/// assert_eq!(properties.get_header_str("logId").as_deref(), Some("request-1234"));
/// assert!(properties.get_header("opUid").is_none());
/// ```
pub fn string_headers<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> FieldTable {
    let mut headers = FieldTable::default();
    for (name, value) in pairs {
        if !value.is_empty() {
            headers.insert(name.into(), AMQPValue::LongString(value.into()));
        }
    }
    headers
}
