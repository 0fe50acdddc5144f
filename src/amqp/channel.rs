//! Implements [`BrokerChannel`] for a [`lapin::Channel`].
use crate::connection::{BrokerChannel, Delivery, DeliveryCallback, PublishConfirmation};
use amq_protocol_types::{DeliveryTag, FieldTable};
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions,
    },
    publisher_confirm::Confirmation,
    BasicProperties,
};

/// A `lapin` channel, together with the connection it was opened on.
///
/// Closing a `LapinChannel` closes the whole connection.
pub struct LapinChannel {
    connection: lapin::Connection,
    channel: lapin::Channel,
}

impl LapinChannel {
    pub fn new(connection: lapin::Connection, channel: lapin::Channel) -> Self {
        Self {
            connection,
            channel,
        }
    }

    /// Get access to the underlying raw channel
    pub fn raw(&self) -> &lapin::Channel {
        &self.channel
    }
}

#[async_trait::async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    fn is_connection_open(&self) -> bool {
        self.connection.status().connected()
    }

    #[tracing::instrument(level = "debug", skip(self, payload, properties))]
    async fn publish(
        &self,
        payload: &[u8],
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
    ) -> Result<PublishConfirmation, anyhow::Error> {
        let options = BasicPublishOptions {
            mandatory: false,
            // The immediate flag was dropped in RabbitMQ 3.0 - see https://www.rabbitmq.com/blog/2012/11/19/breaking-things-with-rabbitmq-3-0/
            // Setting `true` will cause a not-supported error
            immediate: false,
        };
        let confirm = self
            .channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await?
            .await?;

        Ok(match confirm {
            Confirmation::Ack(_) => PublishConfirmation::Ack,
            Confirmation::Nack(_) => PublishConfirmation::Nack,
            Confirmation::NotRequested => PublishConfirmation::NotRequested,
        })
    }

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        prefetch_size: u32,
        connection_global: bool,
    ) -> Result<(), anyhow::Error> {
        // RabbitMq does not implement prefetch_size and lapin does not expose it.
        if prefetch_size != 0 {
            anyhow::bail!("A non-zero prefetch size ({prefetch_size}) is not supported");
        }
        self.channel
            .basic_qos(
                prefetch_count,
                BasicQosOptions {
                    global: connection_global,
                },
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_basic_consume", skip(self, callback))]
    async fn basic_consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        callback: DeliveryCallback,
    ) -> Result<String, anyhow::Error> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let consumer_tag = consumer.tag().as_str().to_owned();

        // Pump deliveries into the callback, in the order they come off the wire.
        // The stream ends when the consumer is cancelled or the channel goes away.
        tokio::spawn({
            let consumer_tag = consumer_tag.clone();
            async move {
                while let Some(delivery) = consumer.next().await {
                    match delivery {
                        Ok(delivery) => callback(Delivery::from(delivery)),
                        Err(e) => {
                            tracing::error!(
                                consumer_tag = %consumer_tag,
                                "Consumer error: {}",
                                e
                            );
                            break;
                        }
                    }
                }
                tracing::debug!(consumer_tag = %consumer_tag, "Consumer stream ended");
            }
        });

        Ok(consumer_tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_client_ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn basic_reject(
        &self,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), anyhow::Error> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.connection.close(200, "OK").await?;
        Ok(())
    }
}
