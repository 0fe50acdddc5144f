use crate::codec::Codec;
use crate::connection::{ChannelRef, Delivery, ResilientConnection};
use crate::consumers::{MessageEnvelope, QueueConsumerDelegate};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Turns the deliveries of one consumer into concurrently running delegate calls.
///
/// The broker-facing callback only builds the envelope and spawns the task: it returns
/// immediately, so the next delivery can be dispatched while the previous ones are
/// still being processed.
pub(crate) struct ConsumptionHandler<T> {
    delegate: Arc<dyn QueueConsumerDelegate<T>>,
    connection: Arc<ResilientConnection>,
    codec: Arc<dyn Codec<T>>,
    queue_name: String,
    /// Known once the broker accepted the consumer.
    consumer_tag: OnceLock<String>,
}

impl<T> ConsumptionHandler<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new(
        delegate: Arc<dyn QueueConsumerDelegate<T>>,
        connection: Arc<ResilientConnection>,
        codec: Arc<dyn Codec<T>>,
        queue_name: String,
    ) -> Self {
        Self {
            delegate,
            connection,
            codec,
            queue_name,
            consumer_tag: OnceLock::new(),
        }
    }

    pub(crate) fn set_consumer_tag(&self, consumer_tag: String) {
        let _ = self.consumer_tag.set(consumer_tag);
    }

    /// Wrap `delivery` in an envelope bound to `channel` and process it in a new task.
    pub(crate) fn handle_message(
        &self,
        channel: ChannelRef,
        delivery: Delivery,
    ) -> JoinHandle<()> {
        let span = tracing::info_span!(
            "handle_message",
            queue_name = %self.queue_name,
            consumer_tag = self.consumer_tag.get().map(String::as_str),
            delivery_tag = delivery.delivery_tag,
            channel_epoch = channel.epoch(),
        );
        let message = MessageEnvelope::new(
            delivery,
            channel,
            self.connection.clone(),
            self.codec.clone(),
            self.queue_name.clone(),
        );
        tokio::spawn(handle_callback(self.delegate.clone(), message).instrument(span))
    }
}

async fn handle_callback<T>(
    delegate: Arc<dyn QueueConsumerDelegate<T>>,
    message: MessageEnvelope<T>,
) where
    T: Send + Sync + 'static,
{
    let outcome = AssertUnwindSafe(delegate.on_queue_message(&message))
        .catch_unwind()
        .await;
    let handler_error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(panic) => Some(anyhow::anyhow!(
            "The message handler panicked: {}",
            panic_message(panic.as_ref())
        )),
    };

    if let Some(handler_error) = handler_error {
        tracing::debug!("Failed to handle message: {:?}", handler_error);
        let hook = AssertUnwindSafe(delegate.on_message_handle_error(handler_error, &message))
            .catch_unwind()
            .await;
        if let Err(panic) = hook {
            tracing::error!(
                "The message error handler panicked: {}",
                panic_message(panic.as_ref())
            );
        }
    }

    if !message.is_settled() {
        tracing::warn!("Message was neither acked nor rejected");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown cause"
    }
}
