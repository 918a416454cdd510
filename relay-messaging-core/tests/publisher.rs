use std::{sync::Arc, time::Duration};

use relay_messaging_core::{
    testing::{guest_params, InMemoryBroker},
    Destination, JsonCodec, MessageProperties, MessagingError, PublishRetryPolicy, Publisher,
};
use serde_json::json;
use tokio::time::Instant;

fn orders() -> Destination {
    Destination::new("orders", "shop").unwrap()
}

async fn publisher(broker: &InMemoryBroker) -> Publisher {
    Publisher::connect(
        orders(),
        guest_params(),
        Arc::new(broker.clone()),
        Arc::new(JsonCodec),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn connect_declares_the_destination() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker).await;

    assert_eq!(publisher.destination().queue(), "ORDERS");
    assert!(broker.exchange_exists("SHOP"));
    assert!(broker.queue_exists("ORDERS"));
    assert!(broker.is_bound("ORDERS", "SHOP", "ORDERS"));
    // publishers never create dead-letter queues
    assert!(!broker.queue_exists("FAILED-ORDERS"));
}

#[tokio::test]
async fn publish_applies_persistent_defaults() {
    let broker = InMemoryBroker::new();
    let mut publisher = publisher(&broker).await;

    publisher.publish(&json!({"order_id": 1})).await.unwrap();

    let sent = broker.published_to("ORDERS");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].exchange, "SHOP");
    assert_eq!(sent[0].body, br#"{"order_id":1}"#);

    let props = &sent[0].properties;
    assert_eq!(props.content_type.as_deref(), Some("application/json"));
    assert_eq!(props.content_encoding.as_deref(), Some("utf-8"));
    assert_eq!(props.delivery_mode, Some(2));
    assert_eq!(props.expiration.as_deref(), Some("86400000"));
    assert!(props.timestamp.is_some());
}

#[tokio::test]
async fn overrides_replace_defaults() {
    let broker = InMemoryBroker::new();
    let mut publisher = publisher(&broker).await;

    let overrides = MessageProperties::default()
        .with_expiration(Duration::from_secs(1))
        .with_header("source", "checkout");
    publisher
        .publish_with(&json!(["a", "b"]), overrides)
        .await
        .unwrap();

    let props = &broker.published_to("ORDERS")[0].properties;
    assert_eq!(props.expiration.as_deref(), Some("1000"));
    assert_eq!(props.delivery_mode, Some(2));
    assert_eq!(props.headers.get("source").map(String::as_str), Some("checkout"));
}

#[tokio::test]
async fn invalid_overrides_are_rejected_before_sending() {
    let broker = InMemoryBroker::new();
    let mut publisher = publisher(&broker).await;

    let overrides = MessageProperties {
        expiration: Some("tomorrow".into()),
        ..Default::default()
    };
    let err = publisher
        .publish_with(&json!({"order_id": 1}), overrides)
        .await
        .unwrap_err();

    assert!(matches!(err, MessagingError::InvalidArgument(_)));
    assert!(broker.published_to("ORDERS").is_empty());
}

#[tokio::test]
async fn unsupported_payloads_are_not_sent() {
    let broker = InMemoryBroker::new();
    let mut publisher = publisher(&broker).await;

    let err = publisher.publish(&1.5f64).await.unwrap_err();
    assert!(matches!(err, MessagingError::Serialization(_)));

    let err = publisher.publish(&true).await.unwrap_err();
    assert!(matches!(err, MessagingError::Serialization(_)));

    assert!(broker.published_to("ORDERS").is_empty());
}

#[tokio::test(start_paused = true)]
async fn publish_backs_off_linearly_between_attempts() {
    let broker = InMemoryBroker::new();
    let mut publisher = publisher(&broker).await;
    broker.fail_publishes(4);

    let started = Instant::now();
    publisher.publish(&json!({"order_id": 1})).await.unwrap();

    // 60s + 120s + 180s + 240s
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(600), "waited {waited:?}");
    assert!(waited < Duration::from_secs(601), "waited {waited:?}");
    assert_eq!(broker.published_to("ORDERS").len(), 1);
    assert_eq!(publisher.retry_state().attempt_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn publish_gives_up_after_five_attempts() {
    let broker = InMemoryBroker::new();
    let mut publisher = publisher(&broker).await;
    broker.fail_publishes(5);

    let err = publisher.publish(&json!({"order_id": 1})).await.unwrap_err();

    match err {
        MessagingError::Publish {
            queue,
            attempts,
            source,
        } => {
            assert_eq!(queue, "ORDERS");
            assert_eq!(attempts, 5);
            assert!(matches!(*source, MessagingError::Broker(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(broker.published_to("ORDERS").is_empty());

    // the counter starts over for the next message
    assert_eq!(publisher.retry_state().attempt_count(), 0);
    publisher.publish(&json!({"order_id": 2})).await.unwrap();
    assert_eq!(broker.published_to("ORDERS").len(), 1);
}

#[tokio::test]
async fn custom_retry_policy_is_honoured() {
    let broker = InMemoryBroker::new();
    let mut publisher = publisher(&broker).await.with_retry_policy(PublishRetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
    });
    broker.fail_publishes(2);

    let err = publisher.publish(&json!("x")).await.unwrap_err();
    assert!(matches!(err, MessagingError::Publish { attempts: 2, .. }));
}

#[tokio::test]
async fn reconnects_after_the_channel_drops() {
    let broker = InMemoryBroker::new();
    let mut publisher = publisher(&broker).await;
    assert_eq!(broker.connect_attempts(), 1);

    broker.disconnect_all();
    publisher.publish(&json!({"order_id": 1})).await.unwrap();

    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(broker.published_to("ORDERS").len(), 1);
}

#[tokio::test]
async fn unroutable_messages_are_not_retried() {
    let broker = InMemoryBroker::new();
    let mut publisher = publisher(&broker).await;

    let err = publisher
        .publish_raw("NOWHERE", b"{}", &MessageProperties::default())
        .await
        .unwrap_err();

    assert!(matches!(err, MessagingError::Unroutable(_)));
    assert_eq!(broker.returned().len(), 1);
    assert_eq!(publisher.retry_state().attempt_count(), 0);
}

#[tokio::test]
async fn unreachable_broker_fails_construction() {
    let broker = InMemoryBroker::new();
    broker.fail_connects(1);

    let err = Publisher::connect(
        orders(),
        guest_params(),
        Arc::new(broker.clone()),
        Arc::new(JsonCodec),
    )
    .await
    .err()
    .unwrap();

    assert!(matches!(err, MessagingError::Connectivity(_)));
    assert!(!broker.queue_exists("ORDERS"));
}
