use amq_protocol_types::{DeliveryTag, ShortString};
use lapin::BasicProperties;
use std::sync::Arc;

/// A message pushed by the broker to one of our consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The delivery tag of the message, scoped to the channel that delivered it.
    pub delivery_tag: DeliveryTag,

    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: ShortString,

    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: ShortString,

    /// Whether this message was redelivered
    pub redelivered: bool,

    /// Contains the properties and the headers of the
    /// message.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange,
            routing_key: value.routing_key,
            redelivered: value.redelivered,
            properties: value.properties,
            data: value.data,
        }
    }
}

/// Invoked by a [`BrokerChannel`] once for every message delivered to a consumer,
/// in the order the broker sent them.
///
/// The callback must return quickly: the next delivery is not dispatched until it does.
pub type DeliveryCallback = Arc<dyn Fn(Delivery) + Send + Sync + 'static>;

/// Invoked by the transport when an established connection fails on its own,
/// e.g. a dropped socket or a missed heartbeat.
pub type ConnectionErrorCallback = Arc<dyn Fn(anyhow::Error) + Send + Sync + 'static>;

/// The outcome of publishing a message, as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishConfirmation {
    /// The broker confirmed the message.
    Ack,
    /// The broker refused to take responsibility for the message.
    Nack,
    /// Publisher confirms are not enabled on the channel.
    NotRequested,
}

/// `Connector` establishes connections to the broker, handing back the channel all
/// operations of a [`QueueClient`](crate::QueueClient) are issued on.
///
/// Every call is expected to open a brand new connection.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        on_error: ConnectionErrorCallback,
    ) -> Result<Arc<dyn BrokerChannel>, anyhow::Error>;
}

/// The channel primitives the queue client relies on.
///
/// Wire encoding, heartbeats and socket I/O are all the implementer's concern.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// `false` once the channel, or the connection it lives on, has been closed.
    fn is_open(&self) -> bool;

    /// `false` once the connection this channel lives on has been closed.
    ///
    /// A channel can fail on its own while its connection stays up.
    fn is_connection_open(&self) -> bool {
        self.is_open()
    }

    async fn publish(
        &self,
        payload: &[u8],
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
    ) -> Result<PublishConfirmation, anyhow::Error>;

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        prefetch_size: u32,
        connection_global: bool,
    ) -> Result<(), anyhow::Error>;

    /// Register `callback` as the consumer of `queue_name`.
    ///
    /// An empty `consumer_tag` lets the broker pick one. The tag actually in use is returned.
    async fn basic_consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        callback: DeliveryCallback,
    ) -> Result<String, anyhow::Error>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error>;

    async fn basic_client_ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error>;

    async fn basic_reject(
        &self,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), anyhow::Error>;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// assert it's object safe
type _CHECK = Box<dyn BrokerChannel>;
