use crate::helpers::{eventually, get_client, queue_name};
use easy_queue::connection::{InMemoryBroker, Settlement};
use easy_queue::consumers::{MessageEnvelope, QueueConsumerDelegate};
use easy_queue::{QueueClient, QueueError};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Settles messages through the client, once allowed to, and records the outcome.
#[derive(Clone)]
struct DeferredSettlement {
    client: QueueClient,
    requeue: Option<bool>,
    started: Arc<Notify>,
    proceed: Arc<Notify>,
    outcomes: Arc<Mutex<Vec<Result<(), String>>>>,
}

impl DeferredSettlement {
    fn new(client: &QueueClient, requeue: Option<bool>) -> Self {
        Self {
            client: client.clone(),
            requeue,
            started: Default::default(),
            proceed: Default::default(),
            outcomes: Default::default(),
        }
    }

    fn outcomes(&self) -> Vec<Result<(), String>> {
        self.outcomes.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl QueueConsumerDelegate<Value> for DeferredSettlement {
    async fn on_queue_message(
        &self,
        message: &MessageEnvelope<Value>,
    ) -> Result<(), anyhow::Error> {
        self.started.notify_one();
        self.proceed.notified().await;
        let outcome = match self.requeue {
            None => self.client.ack(message).await,
            Some(requeue) => self.client.reject(message, requeue).await,
        };
        let outcome = outcome.map_err(|e| match e {
            QueueError::StaleDelivery { .. } => "stale".to_owned(),
            e => e.to_string(),
        });
        self.outcomes.lock().unwrap().push(outcome);
        Ok(())
    }
}

#[tokio::test]
async fn messages_are_settled_through_the_client() {
    // Arrange
    let broker = InMemoryBroker::new();
    let client = get_client(&broker);
    let queue = queue_name();
    let delegate = DeferredSettlement::new(&client, Some(true));
    client
        .consume(&queue, Arc::new(delegate.clone()), None)
        .await
        .unwrap();

    // Act
    let delivery_tag = broker.deliver(&queue, "{}").unwrap();
    delegate.proceed.notify_one();

    // Assert
    eventually(|| delegate.outcomes().len() == 1).await;
    assert_eq!(vec![Ok(())], delegate.outcomes());
    assert_eq!(
        vec![Settlement::Reject {
            delivery_tag,
            requeue: true
        }],
        broker.settlements()
    );
}

#[tokio::test]
async fn acking_after_a_reconnect_fails_with_a_stale_delivery() {
    // Arrange
    let broker = InMemoryBroker::new();
    let client = get_client(&broker);
    let queue = queue_name();
    let delegate = DeferredSettlement::new(&client, None);
    client
        .consume(&queue, Arc::new(delegate.clone()), None)
        .await
        .unwrap();
    broker.deliver(&queue, "{}").unwrap();
    delegate.started.notified().await;

    // Act
    broker.drop_connections();
    client.connect().await.unwrap();
    delegate.proceed.notify_one();

    // Assert
    eventually(|| delegate.outcomes().len() == 1).await;
    assert_eq!(vec![Err("stale".to_owned())], delegate.outcomes());
    assert!(broker.settlements().is_empty());
    assert_eq!(2, broker.connection_attempts());
}

#[tokio::test]
async fn acking_while_disconnected_reconnects_first_and_then_reports_the_stale_delivery() {
    // Arrange
    let broker = InMemoryBroker::new();
    let client = get_client(&broker);
    let queue = queue_name();
    let delegate = DeferredSettlement::new(&client, None);
    client
        .consume(&queue, Arc::new(delegate.clone()), None)
        .await
        .unwrap();
    broker.deliver(&queue, "{}").unwrap();
    delegate.started.notified().await;

    // Act
    broker.fail_next_connects(2);
    broker.drop_connections();
    delegate.proceed.notify_one();

    // Assert
    eventually(|| delegate.outcomes().len() == 1).await;
    assert_eq!(vec![Err("stale".to_owned())], delegate.outcomes());
    assert_eq!(4, broker.connection_attempts());
    assert!(client.is_connected());
}
