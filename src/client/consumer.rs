use crate::amqp::{Delivery, DeliveryStream, TransportError};
use crate::pool::{Error, PooledChannel};
use futures_util::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A running consumer, returned by [`Client::consume`](super::Client::consume).
///
/// It is a [`Stream`] of the messages delivered to the queue.
///
/// The consumer holds its channel for its whole lifetime: the channel is neither shared
/// with other callers nor reclaimed as idle. Call [`ConsumerHandle::stop`] to cancel the
/// consumer; dropping the handle closes the channel, which cancels it as well.
pub struct ConsumerHandle {
    queue_name: String,
    consumer_tag: String,
    deliveries: DeliveryStream,
    channel: Option<PooledChannel>,
}

impl ConsumerHandle {
    pub(crate) fn new(
        queue_name: String,
        consumer_tag: String,
        deliveries: DeliveryStream,
        channel: PooledChannel,
    ) -> Self {
        Self {
            queue_name,
            consumer_tag,
            deliveries,
            channel: Some(channel),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Cancel the consumer and close its channel.
    ///
    /// Unacknowledged messages are requeued by the broker.
    #[tracing::instrument(name = "rabbitmq_stop_consumer", skip(self), fields(queue = %self.queue_name, consumer_tag = %self.consumer_tag))]
    pub async fn stop(mut self) -> Result<(), Error> {
        let Some(channel) = self.channel.take() else {
            return Ok(());
        };
        let cancelled = channel.basic_cancel(&self.consumer_tag).await;
        channel.discard();
        cancelled.map_err(|e| Error::from_transport("cancel consumer", e))
    }
}

impl Stream for ConsumerHandle {
    type Item = Result<Delivery, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.deliveries.poll_next_unpin(cx)
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.discard();
        }
    }
}

impl fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("queue_name", &self.queue_name)
            .field("consumer_tag", &self.consumer_tag)
            .field("channel", &self.channel)
            .finish()
    }
}
