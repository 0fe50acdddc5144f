use crate::amqp::configuration::QueueSettings;
use crate::amqp::ConnectionFactory;
use crate::codec::{Codec, JsonCodec};
use crate::connection::{
    ConnectionErrorSink, Connector, Delivery, DeliveryCallback, PublishConfirmation,
    ResilientConnection, RetryObserver, TracingRetryObserver,
};
use crate::consumers::{ConsumptionHandler, MessageEnvelope, QueueConsumerDelegate};
use crate::error::QueueError;
use crate::publishers::Publication;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A queue client: publishes messages and consumes queues over a single, self-healing
/// connection to the broker.
///
/// Every operation goes through the connection guard: if the client is not connected,
/// it keeps trying to (re)connect, waiting `seconds_between_connection_retries` between
/// two attempts, until it succeeds or the client is [stopped](QueueClient::stop).
///
/// `QueueClient` is cheap to clone: clones share the same connection and consumers.
///
/// # How do I build a `QueueClient`?
///
/// Start from [`QueueClient::builder`].
///
/// ```rust
/// use easy_queue::amqp::configuration::QueueSettings;
/// use easy_queue::QueueClient;
///
/// # fn build() -> Result<(), easy_queue::QueueError> {
/// let client: QueueClient = QueueClient::builder(QueueSettings::default()).build()?;
/// # Ok(())
/// # }
/// ```
pub struct QueueClient<T = serde_json::Value> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    connection: Arc<ResilientConnection>,
    codec: Arc<dyn Codec<T>>,
    delegate: Option<Arc<dyn QueueConsumerDelegate<T>>>,
    prefetch_count: u16,
    prefetch_size: u32,
    max_message_length: usize,
    consumers: Mutex<HashMap<String, ConsumerRegistration>>,
}

/// A consumer registered through [`QueueClient::consume`].
struct ConsumerRegistration {
    queue_name: String,
    channel_epoch: u64,
}

impl<T> Clone for QueueClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> QueueClient<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Start building a [`QueueClient`] that encodes payloads as JSON.
    pub fn builder(settings: QueueSettings) -> QueueClientBuilder<T> {
        QueueClientBuilder::new(settings, Arc::new(JsonCodec))
    }
}

impl<T> QueueClient<T>
where
    T: Send + Sync + 'static,
{
    /// Start building a [`QueueClient`] with a custom payload codec.
    pub fn builder_with_codec<C>(settings: QueueSettings, codec: C) -> QueueClientBuilder<T>
    where
        C: Codec<T>,
    {
        QueueClientBuilder::new(settings, Arc::new(codec))
    }

    /// Wait until a connection to the broker is established.
    ///
    /// Every other operation connects on demand: calling `connect` is never required,
    /// but it lets you fail fast (or time out) at startup.
    pub async fn connect(&self) -> Result<(), QueueError> {
        let connection = &self.inner.connection;
        connection
            .guarded(move || async move {
                if connection.is_connected() {
                    Ok(())
                } else {
                    Err(QueueError::NotConnected)
                }
            })
            .await
    }

    /// Publish a message.
    ///
    /// The publication is validated (and serialized) before touching the network: an
    /// invalid publication fails straight away, even when the broker is unreachable.
    #[tracing::instrument(name = "queue_put", skip_all)]
    pub async fn put(
        &self,
        publication: Publication<T>,
    ) -> Result<PublishConfirmation, QueueError> {
        let publication =
            publication.prepare(self.inner.codec.as_ref(), self.inner.max_message_length)?;
        let connection = &self.inner.connection;
        connection
            .guarded(move || async move {
                let channel = connection.require_channel()?;
                channel
                    .channel()
                    .publish(
                        &publication.payload,
                        &publication.exchange,
                        &publication.routing_key,
                        publication.properties,
                    )
                    .await
                    .map_err(QueueError::Broker)
            })
            .await
    }

    /// Start consuming `queue_name`, dispatching every message to `delegate`.
    ///
    /// `consumer_name` is used as consumer tag; the broker picks one when it is `None`.
    /// The tag in use is returned: hand it to [`QueueClient::stop_consumer`] to stop consuming.
    ///
    /// Consumers live as long as the channel they were registered on: after a reconnect,
    /// call `consume` again (e.g. from [`QueueConsumerDelegate::on_connection_error`]).
    #[tracing::instrument(name = "queue_consume", skip(self, delegate))]
    pub async fn consume(
        &self,
        queue_name: &str,
        delegate: Arc<dyn QueueConsumerDelegate<T>>,
        consumer_name: Option<&str>,
    ) -> Result<String, QueueError> {
        let connection = &self.inner.connection;
        connection
            .guarded(move || async move {
                let channel = connection.require_channel()?;
                self.ensure_tag_is_free(consumer_name, channel.epoch())?;

                let handler = Arc::new(ConsumptionHandler::new(
                    delegate.clone(),
                    connection.clone(),
                    self.inner.codec.clone(),
                    queue_name.to_owned(),
                ));
                delegate.on_before_start_consumption(queue_name, self).await;

                channel
                    .channel()
                    .basic_qos(self.inner.prefetch_count, self.inner.prefetch_size, false)
                    .await
                    .map_err(QueueError::Broker)?;

                let callback: DeliveryCallback = {
                    let handler = handler.clone();
                    let channel = channel.clone();
                    Arc::new(move |delivery: Delivery| {
                        handler.handle_message(channel.clone(), delivery);
                    })
                };
                let consumer_tag = channel
                    .channel()
                    .basic_consume(queue_name, consumer_name.unwrap_or_default(), callback)
                    .await
                    .map_err(QueueError::Broker)?;
                handler.set_consumer_tag(consumer_tag.clone());
                self.consumers().insert(
                    consumer_tag.clone(),
                    ConsumerRegistration {
                        queue_name: queue_name.to_owned(),
                        channel_epoch: channel.epoch(),
                    },
                );
                tracing::info!(consumer_tag = %consumer_tag, "Started consuming");

                delegate.on_consumption_start(&consumer_tag, self).await;
                Ok(consumer_tag)
            })
            .await
    }

    /// Like [`QueueClient::consume`], using the delegate the client was built with.
    pub async fn consume_with_default_delegate(
        &self,
        queue_name: &str,
        consumer_name: Option<&str>,
    ) -> Result<String, QueueError> {
        let delegate = self.inner.delegate.clone().ok_or_else(|| {
            QueueError::InvalidConfiguration(
                "The client was built without a default delegate".into(),
            )
        })?;
        self.consume(queue_name, delegate, consumer_name).await
    }

    /// Cancel the consumer tagged `consumer_tag`.
    ///
    /// Messages already handed over to the delegate keep being processed until completion.
    /// This does not go through the connection guard: there is nothing to cancel on a
    /// channel that has been replaced.
    #[tracing::instrument(name = "queue_stop_consumer", skip(self))]
    pub async fn stop_consumer(&self, consumer_tag: &str) -> Result<(), QueueError> {
        let channel = self.inner.connection.require_channel()?;
        channel
            .channel()
            .basic_cancel(consumer_tag)
            .await
            .map_err(QueueError::Broker)?;
        if let Some(registration) = self.consumers().remove(consumer_tag) {
            tracing::info!(queue_name = %registration.queue_name, "Stopped consuming");
        }
        Ok(())
    }

    /// Acknowledge `message`. See [`MessageEnvelope::ack`].
    pub async fn ack(&self, message: &MessageEnvelope<T>) -> Result<(), QueueError> {
        message.ack().await
    }

    /// Reject `message`, optionally requeueing it. See [`MessageEnvelope::reject`].
    pub async fn reject(
        &self,
        message: &MessageEnvelope<T>,
        requeue: bool,
    ) -> Result<(), QueueError> {
        message.reject(requeue).await
    }

    /// Tags of the consumers registered on the current channel, sorted.
    ///
    /// Empty while the client is disconnected.
    pub fn active_consumers(&self) -> Vec<String> {
        let epoch = self
            .inner
            .connection
            .current_channel()
            .filter(|c| c.channel().is_open())
            .map(|c| c.epoch());
        let mut tags: Vec<_> = self
            .consumers()
            .iter()
            .filter(|(_, registration)| Some(registration.channel_epoch) == epoch)
            .map(|(tag, _)| tag.clone())
            .collect();
        tags.sort();
        tags
    }

    /// `true` if the client holds an open channel to the broker.
    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// `false` once [`QueueClient::stop`] or [`QueueClient::close`] has been called.
    pub fn is_running(&self) -> bool {
        self.inner.connection.is_running()
    }

    /// Stop retrying to connect. Operations waiting for a connection give up.
    pub fn stop(&self) {
        self.inner.connection.stop();
    }

    /// Stop the client and close its connection to the broker.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.inner
            .connection
            .close()
            .await
            .map_err(QueueError::Broker)?;
        self.consumers().clear();
        Ok(())
    }

    fn ensure_tag_is_free(
        &self,
        consumer_tag: Option<&str>,
        epoch: u64,
    ) -> Result<(), QueueError> {
        let mut consumers = self.consumers();
        // Consumers registered on a previous channel died with it.
        consumers.retain(|_, registration| registration.channel_epoch == epoch);
        match consumer_tag {
            Some(tag) if consumers.contains_key(tag) => {
                Err(QueueError::DuplicateConsumerTag(tag.to_owned()))
            }
            _ => Ok(()),
        }
    }

    fn consumers(&self) -> MutexGuard<'_, HashMap<String, ConsumerRegistration>> {
        match self.inner.consumers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Forwards transport failures to the default delegate of the client.
struct DelegateErrorSink<T> {
    delegate: Arc<dyn QueueConsumerDelegate<T>>,
}

#[async_trait::async_trait]
impl<T> ConnectionErrorSink for DelegateErrorSink<T>
where
    T: Send + Sync + 'static,
{
    async fn on_connection_error(&self, error: anyhow::Error) {
        self.delegate.on_connection_error(error).await;
    }
}

type DelegateFactory<T> = Box<dyn FnOnce() -> Arc<dyn QueueConsumerDelegate<T>> + Send>;

/// A builder for [`QueueClient`].
///
/// Use [`QueueClient::builder`] as entrypoint.
pub struct QueueClientBuilder<T> {
    settings: QueueSettings,
    codec: Arc<dyn Codec<T>>,
    connector: Option<Arc<dyn Connector>>,
    delegate: Option<Arc<dyn QueueConsumerDelegate<T>>>,
    delegate_factory: Option<DelegateFactory<T>>,
    retry_observer: Arc<dyn RetryObserver>,
    retry_interval: Option<Duration>,
}

impl<T> QueueClientBuilder<T>
where
    T: Send + Sync + 'static,
{
    fn new(settings: QueueSettings, codec: Arc<dyn Codec<T>>) -> Self {
        Self {
            settings,
            codec,
            connector: None,
            delegate: None,
            delegate_factory: None,
            retry_observer: Arc::new(TracingRetryObserver),
            retry_interval: None,
        }
    }

    /// Replace the payload codec.
    #[must_use]
    pub fn codec<C: Codec<T>>(mut self, codec: C) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Connect through `connector` instead of opening `lapin` connections to the broker
    /// described by the settings.
    #[must_use]
    pub fn connector<C: Connector>(self, connector: C) -> Self {
        self.with_dyn_connector(Arc::new(connector))
    }

    /// See [`QueueClientBuilder::connector`].
    #[must_use]
    pub fn with_dyn_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// The delegate used by [`QueueClient::consume_with_default_delegate`], notified of
    /// connection errors.
    #[must_use]
    pub fn delegate<D: QueueConsumerDelegate<T>>(self, delegate: D) -> Self {
        self.with_dyn_delegate(Arc::new(delegate))
    }

    /// See [`QueueClientBuilder::delegate`].
    #[must_use]
    pub fn with_dyn_delegate(mut self, delegate: Arc<dyn QueueConsumerDelegate<T>>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Build the default delegate when the client is built.
    ///
    /// Mutually exclusive with [`QueueClientBuilder::delegate`].
    #[must_use]
    pub fn delegate_factory<F, D>(mut self, factory: F) -> Self
    where
        F: FnOnce() -> D + Send + 'static,
        D: QueueConsumerDelegate<T>,
    {
        self.delegate_factory = Some(Box::new(move || {
            Arc::new(factory()) as Arc<dyn QueueConsumerDelegate<T>>
        }));
        self
    }

    /// Observe failed reconnection attempts. Defaults to [`TracingRetryObserver`].
    #[must_use]
    pub fn retry_observer<O: RetryObserver>(mut self, observer: O) -> Self {
        self.retry_observer = Arc::new(observer);
        self
    }

    /// Override `seconds_between_connection_retries`, e.g. to go below one second.
    #[must_use]
    pub fn retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = Some(retry_interval);
        self
    }

    /// Validate the configuration and get an instance of [`QueueClient`].
    ///
    /// No connection is attempted: the client connects on its first operation.
    pub fn build(self) -> Result<QueueClient<T>, QueueError> {
        let delegate = match (self.delegate, self.delegate_factory) {
            (Some(_), Some(_)) => {
                return Err(QueueError::InvalidConfiguration(
                    "Can't provide both a delegate and a delegate factory".into(),
                ))
            }
            (Some(delegate), None) => Some(delegate),
            (None, Some(factory)) => Some(factory()),
            (None, None) => None,
        };

        let settings = &self.settings;
        let prefetch_count = u16::try_from(settings.prefetch_count).map_err(|_| {
            QueueError::InvalidConfiguration(format!(
                "prefetch_count must be between 0 and {}, got {}",
                u16::MAX,
                settings.prefetch_count
            ))
        })?;
        let prefetch_size = u32::try_from(settings.prefetch_size).map_err(|_| {
            QueueError::InvalidConfiguration(format!(
                "prefetch_size must be between 0 and {}, got {}",
                u32::MAX,
                settings.prefetch_size
            ))
        })?;
        let max_message_length = usize::try_from(settings.max_message_length).map_err(|_| {
            QueueError::InvalidConfiguration(format!(
                "max_message_length must be a positive integer, got {}",
                settings.max_message_length
            ))
        })?;

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(ConnectionFactory::new_from_config(settings)));
        let error_sink = delegate.clone().map(|delegate| {
            Arc::new(DelegateErrorSink { delegate }) as Arc<dyn ConnectionErrorSink>
        });
        let connection = ResilientConnection::new(
            connector,
            self.retry_interval
                .unwrap_or_else(|| settings.retry_interval()),
            self.retry_observer,
            error_sink,
        );

        Ok(QueueClient {
            inner: Arc::new(Inner {
                connection: Arc::new(connection),
                codec: self.codec,
                delegate,
                prefetch_count,
                prefetch_size,
                max_message_length,
                consumers: Mutex::new(HashMap::new()),
            }),
        })
    }
}
