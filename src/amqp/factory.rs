use crate::amqp::{channel::LapinChannel, configuration::QueueSettings};
use crate::connection::{BrokerChannel, ConnectionErrorCallback, Connector};
use anyhow::Context;
use lapin::{options::ConfirmSelectOptions, uri::AMQPUri, ConnectionProperties};
use std::sync::Arc;
use tokio::time::timeout;

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker.
///
/// `ConnectionFactory` is the production [`Connector`]: each call to
/// [`Connector::connect`] opens a new `lapin` connection with a single channel on it.
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// The timeout observed when trying to connect to RabbitMq.
    connection_timeout: std::time::Duration,
    publisher_confirms: bool,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// A connection timeout can be (optionally) specified in `settings`.
    /// If the connection timeout is left unspecified, it will be defaulted to 10 seconds.
    pub fn new_from_config(settings: &QueueSettings) -> Self {
        let connection_timeout = settings
            .connection_timeout()
            .unwrap_or_else(|| std::time::Duration::from_secs(10));
        Self {
            uri: settings.amqp_uri(),
            connection_timeout,
            publisher_confirms: settings.publisher_confirms,
        }
    }

    /// Create a new connection to a RabbitMq broker.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self))]
    pub async fn new_connection(&self) -> Result<lapin::Connection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        match timeout(
            self.connection_timeout,
            lapin::Connection::connect_uri(self.uri.clone(), properties),
        )
        .await
        {
            Ok(result) => result.context("Failed to connect to RabbitMQ."),
            Err(_) => Err(anyhow::anyhow!(
                "Timed out while trying to connect to RabbitMQ."
            )),
        }
    }
}

#[async_trait::async_trait]
impl Connector for ConnectionFactory {
    async fn connect(
        &self,
        on_error: ConnectionErrorCallback,
    ) -> Result<Arc<dyn BrokerChannel>, anyhow::Error> {
        let connection = self.new_connection().await?;
        connection.on_error(move |e| on_error(e.into()));

        let channel = connection
            .create_channel()
            .await
            .context("Failed to open a channel on the RabbitMQ connection.")?;
        if self.publisher_confirms {
            // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }

        Ok(Arc::new(LapinChannel::new(connection, channel)))
    }
}
