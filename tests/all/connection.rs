use crate::helpers::{get_client, get_client_builder};
use easy_queue::connection::{InMemoryBroker, ReconnectFailure, RetryObserver};
use easy_queue::publishers::Publication;
use easy_queue::QueueError;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
struct CollectingObserver {
    failures: Arc<Mutex<Vec<(u64, String)>>>,
}

impl RetryObserver for CollectingObserver {
    fn on_reconnect_failure(&self, failure: &ReconnectFailure<'_>) {
        self.failures
            .lock()
            .unwrap()
            .push((failure.retry_count, failure.error.to_string()));
    }
}

#[tokio::test]
async fn failed_connection_attempts_are_reported_to_the_retry_observer() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(2);
    let observer = CollectingObserver::default();
    let client = get_client_builder(&broker)
        .retry_observer(observer.clone())
        .build()
        .unwrap();

    // Act
    client.connect().await.unwrap();

    // Assert
    assert!(client.is_connected());
    assert_eq!(
        vec![
            (1, "connection refused (attempt #1)".to_owned()),
            (2, "connection refused (attempt #2)".to_owned()),
        ],
        *observer.failures.lock().unwrap()
    );
}

#[tokio::test]
async fn connecting_to_an_unreachable_broker_can_be_bounded_by_a_timeout() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(usize::MAX);
    let client = get_client(&broker);

    // Act
    let outcome = tokio::time::timeout(Duration::from_millis(50), client.connect()).await;

    // Assert
    assert!(outcome.is_err());
    assert!(!client.is_connected());
    assert!(broker.connection_attempts() > 1);
}

#[tokio::test]
async fn stopping_the_client_releases_callers_waiting_for_a_connection() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(usize::MAX);
    let client = get_client(&broker);
    let waiting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    while broker.connection_attempts() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // Act
    client.stop();

    // Assert
    let outcome = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("the caller is still waiting for a connection")
        .unwrap();
    assert!(matches!(outcome, Err(QueueError::NotConnected)));
    assert!(!client.is_running());
}

#[tokio::test]
async fn a_closed_client_does_not_reconnect() {
    // Arrange
    let broker = InMemoryBroker::new();
    let client = get_client(&broker);
    client.connect().await.unwrap();

    // Act
    client.close().await.unwrap();
    let outcome = client
        .put(Publication::new("orders").serialized("{}"))
        .await;

    // Assert
    assert!(matches!(outcome, Err(QueueError::NotConnected)));
    assert!(!client.is_connected());
    assert!(!client.is_running());
    assert_eq!(1, broker.connection_attempts());
}
