use super::transport::{
    BrokerChannel, ConnectionErrorCallback, Connector, Delivery, DeliveryCallback,
    PublishConfirmation,
};
use amq_protocol_types::DeliveryTag;
use lapin::BasicProperties;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// An in-process broker, for tests and local pipelines.
///
/// It is scriptable - you can make connection attempts fail, drop live connections and
/// push messages to consumers - and it records everything the client asked it to do.
///
/// `InMemoryBroker` is a cheap handle: clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    failures_left: usize,
    attempts: usize,
    channels: Vec<Arc<InMemoryChannel>>,
    consumers: HashMap<String, Consumer>,
    generated_tags: u64,
    published: Vec<PublishedMessage>,
    settlements: Vec<Settlement>,
    qos_requests: Vec<QosRequest>,
    cancelled: Vec<String>,
}

struct Consumer {
    queue_name: String,
    channel: Arc<InMemoryChannel>,
    callback: DeliveryCallback,
}

/// A message handed to [`BrokerChannel::publish`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
}

/// An ack or reject received by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack {
        delivery_tag: DeliveryTag,
    },
    Reject {
        delivery_tag: DeliveryTag,
        requeue: bool,
    },
}

/// A quality-of-service request received by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosRequest {
    pub prefetch_count: u16,
    pub prefetch_size: u32,
    pub connection_global: bool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A [`Connector`] opening connections against this broker.
    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            broker: self.clone(),
        }
    }

    /// Refuse the next `attempts` connection attempts.
    pub fn fail_next_connects(&self, attempts: usize) {
        self.lock().failures_left = attempts;
    }

    /// How many times a connection was attempted, successful or not.
    pub fn connection_attempts(&self) -> usize {
        self.lock().attempts
    }

    /// Close every open connection, notifying their error callbacks.
    ///
    /// Consumers registered on those connections are lost.
    pub fn drop_connections(&self) {
        let dropped: Vec<_> = {
            let mut state = self.lock();
            state.consumers.clear();
            state
                .channels
                .drain(..)
                .filter(|c| c.open.swap(false, Ordering::SeqCst))
                .collect()
        };
        for channel in dropped {
            (channel.on_error)(anyhow::anyhow!(
                "connection #{} reset by peer",
                channel.connection_id
            ));
        }
    }

    /// Push a message to the first consumer registered on `queue_name`.
    ///
    /// Returns the delivery tag assigned to the message, `None` if nobody is consuming
    /// from the queue.
    pub fn deliver(&self, queue_name: &str, data: impl Into<Vec<u8>>) -> Option<DeliveryTag> {
        self.deliver_with_properties(queue_name, data, BasicProperties::default())
    }

    /// Like [`InMemoryBroker::deliver`], with custom message properties.
    pub fn deliver_with_properties(
        &self,
        queue_name: &str,
        data: impl Into<Vec<u8>>,
        properties: BasicProperties,
    ) -> Option<DeliveryTag> {
        let (delivery, callback) = {
            let state = self.lock();
            let mut consumers: Vec<_> = state
                .consumers
                .iter()
                .filter(|(_, c)| c.queue_name == queue_name && c.channel.is_open())
                .collect();
            consumers.sort_by(|(a, _), (b, _)| a.cmp(b));
            let (_, consumer) = consumers.first()?;

            let delivery = Delivery {
                delivery_tag: consumer.channel.next_delivery_tag(),
                exchange: "".into(),
                routing_key: queue_name.into(),
                redelivered: false,
                properties,
                data: data.into(),
            };
            (delivery, consumer.callback.clone())
        };
        let delivery_tag = delivery.delivery_tag;
        // Invoked outside the lock: the callback is free to talk back to the broker.
        callback(delivery);
        Some(delivery_tag)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.lock().settlements.clone()
    }

    pub fn qos_requests(&self) -> Vec<QosRequest> {
        self.lock().qos_requests.clone()
    }

    /// Tags of the consumers currently registered, sorted.
    pub fn consumer_tags(&self) -> Vec<String> {
        let mut tags: Vec<_> = self.lock().consumers.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Tags of the consumers that were cancelled, in cancellation order.
    pub fn cancelled_consumers(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The [`Connector`] of an [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
}

#[async_trait::async_trait]
impl Connector for InMemoryConnector {
    async fn connect(
        &self,
        on_error: ConnectionErrorCallback,
    ) -> Result<Arc<dyn BrokerChannel>, anyhow::Error> {
        let mut state = self.broker.lock();
        state.attempts += 1;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            anyhow::bail!("connection refused (attempt #{})", state.attempts);
        }
        let channel = Arc::new(InMemoryChannel {
            connection_id: state.attempts,
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
            unsettled: Mutex::new(Unsettled::default()),
            on_error,
        });
        state.channels.push(channel.clone());
        Ok(channel)
    }
}

#[derive(Default)]
struct Unsettled {
    last_delivery_tag: DeliveryTag,
    outstanding: BTreeSet<DeliveryTag>,
}

struct InMemoryChannel {
    connection_id: usize,
    broker: InMemoryBroker,
    open: AtomicBool,
    unsettled: Mutex<Unsettled>,
    on_error: ConnectionErrorCallback,
}

impl InMemoryChannel {
    fn next_delivery_tag(&self) -> DeliveryTag {
        let mut unsettled = self.unsettled();
        unsettled.last_delivery_tag += 1;
        let tag = unsettled.last_delivery_tag;
        unsettled.outstanding.insert(tag);
        tag
    }

    fn settle(&self, settlement: Settlement) -> Result<(), anyhow::Error> {
        self.ensure_open()?;
        let delivery_tag = match settlement {
            Settlement::Ack { delivery_tag } | Settlement::Reject { delivery_tag, .. } => {
                delivery_tag
            }
        };
        if !self.unsettled().outstanding.remove(&delivery_tag) {
            anyhow::bail!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag);
        }
        self.broker.lock().settlements.push(settlement);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), anyhow::Error> {
        if !self.is_open() {
            anyhow::bail!("channel on connection #{} is closed", self.connection_id);
        }
        Ok(())
    }

    fn unsettled(&self) -> MutexGuard<'_, Unsettled> {
        match self.unsettled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait::async_trait]
impl BrokerChannel for InMemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        payload: &[u8],
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
    ) -> Result<PublishConfirmation, anyhow::Error> {
        self.ensure_open()?;
        self.broker.lock().published.push(PublishedMessage {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload: payload.to_vec(),
            properties,
        });
        Ok(PublishConfirmation::NotRequested)
    }

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        prefetch_size: u32,
        connection_global: bool,
    ) -> Result<(), anyhow::Error> {
        self.ensure_open()?;
        self.broker.lock().qos_requests.push(QosRequest {
            prefetch_count,
            prefetch_size,
            connection_global,
        });
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        callback: DeliveryCallback,
    ) -> Result<String, anyhow::Error> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let consumer_tag = if consumer_tag.is_empty() {
            state.generated_tags += 1;
            format!("amq.ctag-{}", state.generated_tags)
        } else {
            consumer_tag.to_owned()
        };
        if state.consumers.contains_key(&consumer_tag) {
            anyhow::bail!("NOT_ALLOWED - attempt to reuse consumer tag '{}'", consumer_tag);
        }
        let channel = state
            .channels
            .iter()
            .find(|c| c.connection_id == self.connection_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("channel #{} is unknown", self.connection_id))?;
        state.consumers.insert(
            consumer_tag.clone(),
            Consumer {
                queue_name: queue_name.into(),
                channel,
                callback,
            },
        );
        Ok(consumer_tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        state.consumers.remove(consumer_tag);
        state.cancelled.push(consumer_tag.into());
        Ok(())
    }

    async fn basic_client_ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error> {
        self.settle(Settlement::Ack { delivery_tag })
    }

    async fn basic_reject(
        &self,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), anyhow::Error> {
        self.settle(Settlement::Reject {
            delivery_tag,
            requeue,
        })
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.open.store(false, Ordering::SeqCst);
        let mut state = self.broker.lock();
        state
            .consumers
            .retain(|_, c| c.channel.connection_id != self.connection_id);
        state
            .channels
            .retain(|c| c.connection_id != self.connection_id);
        Ok(())
    }
}
