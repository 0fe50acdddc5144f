use easy_queue::amqp::configuration::QueueSettings;
use easy_queue::consumers::{MessageEnvelope, QueueConsumerDelegate};
use easy_queue::publishers::Publication;
use easy_queue::QueueClient;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use tracing_subscriber::EnvFilter;

const QUEUE_NAME: &str = "hello";
const CONSUMER_TAG: &str = "hello-consumer";

/// Greets every message it receives.
#[derive(Default)]
struct Greeter {
    client: OnceLock<QueueClient>,
}

#[async_trait::async_trait]
impl QueueConsumerDelegate<Value> for Greeter {
    async fn on_consumption_start(&self, consumer_tag: &str, _queue: &QueueClient) {
        tracing::info!(consumer_tag, "Waiting for messages on `{}`", QUEUE_NAME);
    }

    async fn on_queue_message(
        &self,
        message: &MessageEnvelope<Value>,
    ) -> Result<(), anyhow::Error> {
        let data = message.deserialized_data()?;
        tracing::info!("Hello {}!", data["name"]);
        message.ack().await?;
        Ok(())
    }

    async fn on_message_handle_error(
        &self,
        handler_error: anyhow::Error,
        message: &MessageEnvelope<Value>,
    ) {
        tracing::error!("Dropping message: {:?}", handler_error);
        if let Err(e) = message.reject(false).await {
            tracing::error!("Failed to reject message: {}", e);
        }
    }

    async fn on_connection_error(&self, error: anyhow::Error) {
        tracing::warn!("Lost the connection to the broker: {}", error);
        // Consumers do not survive a reconnect: register again. `consume` waits for the
        // broker to be back.
        if let Some(client) = self.client.get() {
            if let Err(e) = client
                .consume_with_default_delegate(QUEUE_NAME, Some(CONSUMER_TAG))
                .await
            {
                tracing::error!("Failed to resume consumption: {}", e);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // We are using the out-of-the-box parameters for the default RabbitMq Docker image.
    // Make sure a queue named `hello` exists on it.
    let settings = QueueSettings::default();

    // The default delegate is the one notified when the connection breaks. We keep a handle
    // on it to give it access to the client once it is built.
    let greeter = Arc::new(Greeter::default());
    let client: QueueClient = QueueClient::builder(settings)
        .with_dyn_delegate(greeter.clone())
        .build()?;
    let _ = greeter.client.set(client.clone());

    // Nothing happens over the network until the first operation: this waits, retrying
    // every `seconds_between_connection_retries`, until the broker accepts our connection.
    client
        .consume_with_default_delegate(QUEUE_NAME, Some(CONSUMER_TAG))
        .await?;

    // Publishing to the default exchange routes the message straight to the queue
    // named after the routing key.
    client
        .put(Publication::new(QUEUE_NAME).data(json!({"name": "world"})))
        .await?;

    tokio::signal::ctrl_c().await?;
    client.stop_consumer(CONSUMER_TAG).await?;
    client.close().await?;
    Ok(())
}
