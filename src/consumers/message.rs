use crate::codec::Codec;
use crate::connection::{ChannelRef, Delivery, ResilientConnection};
use crate::error::{MessageError, QueueError};
use amq_protocol_types::{DeliveryTag, ShortString};
use lapin::BasicProperties;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// A message consumed from a queue, ready for processing.
///
/// `MessageEnvelope` is the input of
/// [`QueueConsumerDelegate::on_queue_message`](crate::consumers::QueueConsumerDelegate::on_queue_message).
/// It is created once per delivery and owned by the task processing it.
///
/// # Settlement
///
/// The framework never acks or rejects a message on your behalf: call
/// [`MessageEnvelope::ack`] or [`MessageEnvelope::reject`] once you are done with it.
/// Both go through the connection guard and are issued on the channel the message was
/// delivered on. If that channel has been replaced by a reconnect in the meantime they fail
/// with [`QueueError::StaleDelivery`] - the broker will redeliver the message anyway.
pub struct MessageEnvelope<T> {
    serialized_data: Vec<u8>,
    deserialized_data: OnceLock<T>,
    codec: Arc<dyn Codec<T>>,
    delivery_tag: DeliveryTag,
    exchange: ShortString,
    routing_key: ShortString,
    redelivered: bool,
    properties: BasicProperties,
    queue_name: String,
    channel: ChannelRef,
    connection: Arc<ResilientConnection>,
    settled: AtomicBool,
}

impl<T: 'static> MessageEnvelope<T> {
    pub(crate) fn new(
        delivery: Delivery,
        channel: ChannelRef,
        connection: Arc<ResilientConnection>,
        codec: Arc<dyn Codec<T>>,
        queue_name: String,
    ) -> Self {
        Self {
            serialized_data: delivery.data,
            deserialized_data: OnceLock::new(),
            codec,
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            queue_name,
            channel,
            connection,
            settled: AtomicBool::new(false),
        }
    }

    /// The payload, as received from the broker.
    pub fn serialized_data(&self) -> &[u8] {
        &self.serialized_data
    }

    /// The payload, deserialized with the client's codec.
    ///
    /// Deserialization happens on the first call; the result is cached for the lifetime of
    /// the envelope. A malformed payload is reported here, not when the message is delivered.
    pub fn deserialized_data(&self) -> Result<&T, MessageError> {
        if let Some(data) = self.deserialized_data.get() {
            return Ok(data);
        }
        let data = self.codec.deserialize(&self.serialized_data)?;
        Ok(self.deserialized_data.get_or_init(|| data))
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery_tag
    }

    /// The queue the message was consumed from.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange(&self) -> &str {
        self.exchange.as_str()
    }

    pub fn routing_key(&self) -> &str {
        self.routing_key.as_str()
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    /// The epoch of the channel the message was delivered on.
    pub fn channel_epoch(&self) -> u64 {
        self.channel.epoch()
    }

    /// `true` once the message was successfully acked or rejected.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Acknowledge the message: the broker will forget about it.
    #[tracing::instrument(name = "message_ack", skip(self), fields(delivery_tag = self.delivery_tag))]
    pub async fn ack(&self) -> Result<(), QueueError> {
        self.ensure_unsettled()?;
        self.connection
            .guarded(move || async move {
                let channel = self.bound_channel()?;
                channel
                    .channel()
                    .basic_client_ack(self.delivery_tag)
                    .await
                    .map_err(QueueError::Broker)?;
                self.settled.store(true, Ordering::SeqCst);
                tracing::debug!("Message acked");
                Ok(())
            })
            .await
    }

    /// Reject the message. It is dead-lettered or discarded unless `requeue` is `true`.
    #[tracing::instrument(name = "message_reject", skip(self), fields(delivery_tag = self.delivery_tag))]
    pub async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        self.ensure_unsettled()?;
        self.connection
            .guarded(move || async move {
                let channel = self.bound_channel()?;
                channel
                    .channel()
                    .basic_reject(self.delivery_tag, requeue)
                    .await
                    .map_err(QueueError::Broker)?;
                self.settled.store(true, Ordering::SeqCst);
                tracing::debug!("Message rejected");
                Ok(())
            })
            .await
    }

    fn ensure_unsettled(&self) -> Result<(), QueueError> {
        if self.is_settled() {
            return Err(QueueError::AlreadySettled(self.delivery_tag));
        }
        Ok(())
    }

    /// The channel the message was delivered on, as long as it is still the current one.
    fn bound_channel(&self) -> Result<&ChannelRef, QueueError> {
        let current = self.connection.require_channel()?;
        if current.epoch() != self.channel.epoch() {
            return Err(QueueError::StaleDelivery {
                delivery_tag: self.delivery_tag,
                delivery_epoch: self.channel.epoch(),
                current_epoch: current.epoch(),
            });
        }
        Ok(&self.channel)
    }
}

impl<T: 'static> std::fmt::Debug for MessageEnvelope<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageEnvelope")
            .field("delivery_tag", &self.delivery_tag)
            .field("queue_name", &self.queue_name)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("channel_epoch", &self.channel.epoch())
            .field("settled", &self.is_settled())
            .field("length", &self.serialized_data.len())
            .finish()
    }
}
