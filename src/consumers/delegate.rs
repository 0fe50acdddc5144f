use crate::consumers::MessageEnvelope;
use crate::QueueClient;

/// The set of callbacks a [`QueueClient`] invokes during consumption.
///
/// Only [`QueueConsumerDelegate::on_queue_message`] is mandatory: every other hook
/// defaults to doing nothing.
///
/// # Concurrency
///
/// Every delivery is processed in its own task: `on_queue_message` (and, if it fails,
/// `on_message_handle_error`) can run concurrently with itself for different messages,
/// up to the prefetch count of the client. A slow or failing message never blocks the others.
///
/// # Settlement
///
/// Messages are not acked automatically on success, nor rejected on failure: call
/// [`MessageEnvelope::ack`] or [`MessageEnvelope::reject`] from your hooks.
#[async_trait::async_trait]
pub trait QueueConsumerDelegate<T>: Send + Sync + 'static
where
    T: Send + Sync + 'static,
{
    /// Invoked by `consume`, before the consumer is registered with the broker.
    async fn on_before_start_consumption(&self, _queue_name: &str, _queue: &QueueClient<T>) {}

    /// Invoked by `consume` once the broker accepted the consumer.
    async fn on_consumption_start(&self, _consumer_tag: &str, _queue: &QueueClient<T>) {}

    /// Process a message. Returning an error hands the message over to
    /// [`QueueConsumerDelegate::on_message_handle_error`].
    async fn on_queue_message(&self, message: &MessageEnvelope<T>) -> Result<(), anyhow::Error>;

    /// Invoked when `on_queue_message` fails or panics.
    ///
    /// This is the place to reject (or requeue) the message.
    async fn on_message_handle_error(
        &self,
        _handler_error: anyhow::Error,
        _message: &MessageEnvelope<T>,
    ) {
    }

    /// Invoked when the transport reports that the connection broke.
    ///
    /// The client reconnects by itself on the next operation, but consumers are not
    /// re-registered: call `consume` again from here if you need to keep consuming.
    async fn on_connection_error(&self, _error: anyhow::Error) {}
}
