use crate::helpers::{get_client, get_client_builder, get_queue_settings};
use easy_queue::amqp::BasicProperties;
use easy_queue::connection::{InMemoryBroker, PublishConfirmation};
use easy_queue::publishers::Publication;
use easy_queue::QueueError;
use fake::{Fake, Faker};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[tokio::test]
async fn put_publishes_the_serialized_payload() {
    // Arrange
    let broker = InMemoryBroker::new();
    let client = get_client(&broker);

    // Act
    let confirmation = client
        .put(
            Publication::new("orders.created")
                .exchange("orders")
                .data(json!({"id": 42, "customer": "Zoë"})),
        )
        .await
        .unwrap();

    // Assert
    assert_eq!(PublishConfirmation::NotRequested, confirmation);
    let published = broker.published();
    assert_eq!(1, published.len());
    assert_eq!("orders", published[0].exchange);
    assert_eq!("orders.created", published[0].routing_key);
    assert_eq!(
        r#"{"id":42,"customer":"Zoë"}"#,
        std::str::from_utf8(&published[0].payload).unwrap()
    );
    let properties = &published[0].properties;
    assert_eq!(
        Some("application/json"),
        properties.content_type().as_ref().map(|c| c.as_str())
    );
    assert!(properties.message_id().is_some());
    assert!(properties.timestamp().is_some());
}

#[tokio::test]
async fn custom_properties_are_preserved() {
    // Arrange
    let broker = InMemoryBroker::new();
    let client = get_client(&broker);
    let correlation_id: String = Faker.fake();
    let properties = BasicProperties::default().with_correlation_id(correlation_id.clone().into());

    // Act
    client
        .put(
            Publication::new("replies")
                .serialized("pong")
                .properties(properties),
        )
        .await
        .unwrap();

    // Assert
    let published = broker.published();
    assert_eq!(b"pong".to_vec(), published[0].payload);
    assert_eq!(
        Some(correlation_id.as_str()),
        published[0]
            .properties
            .correlation_id()
            .as_ref()
            .map(|c| c.as_str())
    );
}

#[tokio::test]
async fn typed_payloads_go_through_the_codec() {
    #[derive(Serialize, Deserialize)]
    struct OrderCreated {
        id: u64,
        lines: Vec<String>,
    }

    // Arrange
    let broker = InMemoryBroker::new();
    let client = easy_queue::QueueClient::<OrderCreated>::builder(get_queue_settings())
        .connector(broker.connector())
        .build()
        .unwrap();

    // Act
    client
        .put(Publication::new("orders").data(OrderCreated {
            id: 7,
            lines: vec!["espresso".into()],
        }))
        .await
        .unwrap();

    // Assert
    assert_eq!(
        json!({"id": 7, "lines": ["espresso"]}),
        serde_json::from_slice::<Value>(&broker.published()[0].payload).unwrap()
    );
}

#[tokio::test]
async fn put_waits_for_the_broker_to_accept_a_connection() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(3);
    let client = get_client(&broker);

    // Act
    client
        .put(Publication::new("orders").serialized("{}"))
        .await
        .unwrap();

    // Assert
    assert_eq!(4, broker.connection_attempts());
    assert_eq!(1, broker.published().len());
}

#[tokio::test]
async fn put_reconnects_after_the_connection_dropped() {
    // Arrange
    let broker = InMemoryBroker::new();
    let client = get_client(&broker);
    client
        .put(Publication::new("orders").serialized("1"))
        .await
        .unwrap();

    // Act
    broker.drop_connections();
    client
        .put(Publication::new("orders").serialized("2"))
        .await
        .unwrap();

    // Assert
    assert_eq!(2, broker.connection_attempts());
    let payloads: Vec<_> = broker.published().into_iter().map(|p| p.payload).collect();
    assert_eq!(vec![b"1".to_vec(), b"2".to_vec()], payloads);
}

#[tokio::test]
async fn invalid_publications_are_refused_before_connecting() {
    // Arrange
    let broker = InMemoryBroker::new();
    let client = get_client_builder(&broker).build().unwrap();

    // Act
    let both = client
        .put(Publication::new("orders").data(json!(1)).serialized("1"))
        .await;
    let neither = client.put(Publication::new("orders")).await;

    // Assert
    assert!(matches!(both, Err(QueueError::InvalidPublication)));
    assert!(matches!(neither, Err(QueueError::InvalidPublication)));
    assert_eq!(0, broker.connection_attempts());
}

#[tokio::test]
async fn oversized_messages_are_refused_before_connecting() {
    // Arrange
    let broker = InMemoryBroker::new();
    let settings = easy_queue::amqp::configuration::QueueSettings {
        max_message_length: 8,
        ..get_queue_settings()
    };
    let client = easy_queue::QueueClient::<Value>::builder(settings)
        .connector(broker.connector())
        .build()
        .unwrap();

    // Act
    let outcome = client
        .put(Publication::new("orders").serialized("0123456789"))
        .await;

    // Assert
    assert!(matches!(
        outcome,
        Err(QueueError::MessageTooLarge {
            length: 10,
            max_length: 8
        })
    ));
    assert_eq!(0, broker.connection_attempts());
}

#[tokio::test]
async fn put_fails_when_the_client_is_stopped_before_connecting() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(usize::MAX);
    let client = get_client(&broker);
    client.stop();

    // Act
    let outcome = client.put(Publication::new("orders").serialized("{}")).await;

    // Assert
    assert!(matches!(outcome, Err(QueueError::NotConnected)));
    assert!(broker.published().is_empty());
}
