//! Connection management: the transport seam, the swappable channel cell and the
//! guard that reconnects before every operation needing a live channel.
//!
//! [`ResilientConnection`] owns the single connection of a [`QueueClient`](crate::QueueClient).
//! The current channel lives in an indirection cell: every successful connect installs a
//! new [`ChannelRef`] with a strictly greater epoch, so anything holding on to an older
//! one can tell it has been replaced.
mod guard;
mod in_memory;
mod transport;

pub use guard::{ReconnectFailure, RetryObserver, TracingRetryObserver};
pub use in_memory::{
    InMemoryBroker, InMemoryConnector, PublishedMessage, QosRequest, Settlement,
};
pub use transport::{
    BrokerChannel, ConnectionErrorCallback, Connector, Delivery, DeliveryCallback,
    PublishConfirmation,
};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Notified when the transport reports a failure on an established connection.
#[async_trait]
pub(crate) trait ConnectionErrorSink: Send + Sync + 'static {
    async fn on_connection_error(&self, error: anyhow::Error);
}

/// A channel, tagged with the epoch of the connection that opened it.
#[derive(Clone)]
pub struct ChannelRef {
    epoch: u64,
    channel: Arc<dyn BrokerChannel>,
}

impl ChannelRef {
    /// Identifies the connection this channel belongs to. Starts at `1` and grows by one
    /// on every reconnect.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn channel(&self) -> &dyn BrokerChannel {
        self.channel.as_ref()
    }
}

impl std::fmt::Debug for ChannelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRef")
            .field("epoch", &self.epoch)
            .field("open", &self.channel.is_open())
            .finish()
    }
}

/// The shared, self-healing connection of a queue client.
pub struct ResilientConnection {
    connector: Arc<dyn Connector>,
    current: RwLock<Option<ChannelRef>>,
    epoch: AtomicU64,
    /// Serialises connection attempts: at most one is in flight at any time.
    connect_lock: tokio::sync::Mutex<()>,
    is_running: AtomicBool,
    retry_interval: Duration,
    observer: Arc<dyn RetryObserver>,
    error_sink: Option<Arc<dyn ConnectionErrorSink>>,
}

impl ResilientConnection {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        retry_interval: Duration,
        observer: Arc<dyn RetryObserver>,
        error_sink: Option<Arc<dyn ConnectionErrorSink>>,
    ) -> Self {
        Self {
            connector,
            current: RwLock::new(None),
            epoch: AtomicU64::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
            is_running: AtomicBool::new(true),
            retry_interval,
            observer,
            error_sink,
        }
    }

    /// `true` if a channel is installed and neither it nor its connection has been closed.
    pub fn is_connected(&self) -> bool {
        self.current_channel()
            .map(|c| c.channel.is_open())
            .unwrap_or(false)
    }

    /// The channel currently in use, if a connection was ever established.
    ///
    /// The returned channel may have been closed since - check [`ResilientConnection::is_connected`].
    pub fn current_channel(&self) -> Option<ChannelRef> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Like [`ResilientConnection::current_channel`], failing with
    /// [`QueueError::NotConnected`](crate::QueueError::NotConnected) when no channel exists.
    pub(crate) fn require_channel(&self) -> Result<ChannelRef, crate::QueueError> {
        self.current_channel().ok_or(crate::QueueError::NotConnected)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Clear the liveness flag: guards stop retrying to connect.
    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
    }

    /// Stop retrying and close the current channel, if any.
    #[tracing::instrument(name = "queue_close", skip(self))]
    pub async fn close(&self) -> Result<(), anyhow::Error> {
        self.stop();
        let current = match self.current.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match current {
            Some(channel) if channel.channel.is_connection_open() => channel.channel.close().await,
            _ => Ok(()),
        }
    }

    /// Open a new connection and install its channel as the current one.
    ///
    /// Callers must hold `connect_lock`.
    #[tracing::instrument(name = "queue_connect", skip(self))]
    async fn connect(&self) -> Result<ChannelRef, anyhow::Error> {
        let channel = self.connector.connect(self.error_callback()).await?;
        let channel = ChannelRef {
            epoch: self.epoch.fetch_add(1, Ordering::SeqCst) + 1,
            channel,
        };
        let replaced = match self.current.write() {
            Ok(mut guard) => guard.replace(channel.clone()),
            Err(poisoned) => poisoned.into_inner().replace(channel.clone()),
        };
        tracing::info!(epoch = channel.epoch, "Connected to the broker");
        if let Some(replaced) = replaced {
            Self::retire(replaced).await;
        }
        Ok(channel)
    }

    /// Close the connection under a replaced channel if the broker still holds it open.
    async fn retire(replaced: ChannelRef) {
        if !replaced.channel.is_connection_open() {
            return;
        }
        if let Err(e) = replaced.channel.close().await {
            tracing::warn!(
                epoch = replaced.epoch,
                error = ?e,
                "Failed to close the replaced broker connection"
            );
        }
    }

    fn error_callback(&self) -> ConnectionErrorCallback {
        let sink = self.error_sink.clone();
        // The transport may report errors from a thread outside of the runtime.
        let runtime = tokio::runtime::Handle::try_current().ok();
        Arc::new(move |error: anyhow::Error| {
            tracing::warn!("Broker connection broken: {:?}", error);
            if let (Some(sink), Some(runtime)) = (sink.clone(), runtime.as_ref()) {
                runtime.spawn(async move { sink.on_connection_error(error).await });
            }
        })
    }
}
