use easy_queue::amqp::configuration::QueueSettings;
use easy_queue::connection::InMemoryBroker;
use easy_queue::consumers::{MessageEnvelope, QueueConsumerDelegate};
use easy_queue::{QueueClient, QueueClientBuilder};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub fn get_queue_settings() -> QueueSettings {
    QueueSettings {
        prefetch_count: 10,
        ..Default::default()
    }
}

/// A client builder wired to `broker`, retrying every millisecond.
pub fn get_client_builder(broker: &InMemoryBroker) -> QueueClientBuilder<Value> {
    QueueClient::builder(get_queue_settings())
        .connector(broker.connector())
        .retry_interval(Duration::from_millis(1))
}

pub fn get_client(broker: &InMemoryBroker) -> QueueClient {
    get_client_builder(broker).build().unwrap()
}

pub fn queue_name() -> String {
    format!("queue-{}", Uuid::new_v4())
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    let polling = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), polling)
        .await
        .expect("the condition never held");
}

/// Records the payload of every message, then acks it.
#[derive(Clone, Default)]
pub struct AckingDelegate {
    pub received: Arc<Mutex<Vec<Value>>>,
}

impl AckingDelegate {
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl QueueConsumerDelegate<Value> for AckingDelegate {
    async fn on_queue_message(
        &self,
        message: &MessageEnvelope<Value>,
    ) -> Result<(), anyhow::Error> {
        let data = message.deserialized_data()?.clone();
        self.received.lock().unwrap().push(data);
        message.ack().await?;
        Ok(())
    }
}
