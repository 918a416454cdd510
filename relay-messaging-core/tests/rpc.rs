use std::{sync::Arc, time::Duration};

use relay_messaging_core::{
    handler_fn,
    testing::{guest_params, InMemoryBroker},
    Connector, ConsumerState, Destination, EnvelopeCodec, JsonCodec, MessageCipher,
    MessageProperties, MessagingError, ReconnectPolicy, RpcClient, RpcHandler, RpcServer,
    SecureCodec,
};
use serde_json::{json, Value};
use tokio::{task::JoinHandle, time::Instant};

const WAIT: Duration = Duration::from_secs(5);

fn squares() -> Destination {
    Destination::new("squares", "math").unwrap()
}

fn square() -> Arc<dyn RpcHandler> {
    handler_fn(|request: Value| {
        let n = request["n"]
            .as_i64()
            .ok_or_else(|| MessagingError::Handler("missing n".into()))?;
        Ok(json!(n * n))
    })
}

async fn serve(
    broker: &InMemoryBroker,
    codec: Arc<dyn EnvelopeCodec>,
    handler: Arc<dyn RpcHandler>,
) -> (relay_messaging_core::ShutdownHandle, JoinHandle<ConsumerState>) {
    let mut server = RpcServer::builder(squares(), guest_params())
        .connector(Arc::new(broker.clone()))
        .codec(codec)
        .handler(handler)
        .build()
        .await
        .unwrap();
    let shutdown = server.shutdown_handle();
    let mut status = server.status();
    let task = tokio::spawn(async move { server.listen().await });
    status
        .wait_for(|state| *state == ConsumerState::Consuming)
        .await
        .unwrap();
    (shutdown, task)
}

async fn client(broker: &InMemoryBroker, codec: Arc<dyn EnvelopeCodec>) -> RpcClient {
    RpcClient::connect(squares(), guest_params(), Arc::new(broker.clone()), codec)
        .await
        .unwrap()
}

#[tokio::test]
async fn call_returns_the_handler_result() {
    let broker = InMemoryBroker::new();
    let (shutdown, server) = serve(&broker, Arc::new(JsonCodec), square()).await;
    let mut client = client(&broker, Arc::new(JsonCodec)).await;

    let raw = tokio::time::timeout(WAIT, client.call(&json!({"n": 4})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(raw, b"16");

    let typed: i64 = client.call_as(&json!({"n": 5})).await.unwrap();
    assert_eq!(typed, 25);

    shutdown.shutdown();
    assert_eq!(server.await.unwrap(), ConsumerState::Closed);
    assert_eq!(broker.acks().len(), 2);
}

#[tokio::test]
async fn reply_queue_is_private_and_bound() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, Arc::new(JsonCodec)).await;

    let reply_queue = client.reply_queue().to_string();
    assert!(reply_queue.starts_with("amq.gen-"));
    assert!(broker.is_bound(&reply_queue, "MATH", &reply_queue));
    assert!(broker.is_bound("SQUARES", "MATH", "SQUARES"));
}

#[tokio::test]
async fn secure_codec_round_trip() {
    let broker = InMemoryBroker::new();
    let codec: Arc<dyn EnvelopeCodec> = Arc::new(SecureCodec::new(MessageCipher::generate()));
    let (shutdown, server) = serve(&broker, Arc::clone(&codec), square()).await;
    let mut client = client(&broker, codec).await;

    let answer: i64 = tokio::time::timeout(WAIT, client.call_as(&json!({"n": 12})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer, 144);

    let request = broker.published_to("SQUARES").remove(0);
    assert_eq!(
        request.properties.content_type.as_deref(),
        Some("application/x-msgpack+xchacha20poly1305")
    );

    shutdown.shutdown();
    server.await.unwrap();
}

#[tokio::test]
async fn stale_replies_are_discarded() {
    let broker = InMemoryBroker::new();
    let (shutdown, server) = serve(&broker, Arc::new(JsonCodec), square()).await;
    let mut client = client(&broker, Arc::new(JsonCodec)).await;

    // a reply nobody is waiting for is already queued
    let intruder = broker.connect(&guest_params()).await.unwrap();
    intruder
        .publish(
            "MATH",
            client.reply_queue(),
            b"999",
            &MessageProperties::default().with_correlation_id("stale"),
        )
        .await
        .unwrap();

    let raw = tokio::time::timeout(WAIT, client.call(&json!({"n": 3})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(raw, b"9");

    shutdown.shutdown();
    server.await.unwrap();
}

#[tokio::test]
async fn call_times_out_without_a_server() {
    let broker = InMemoryBroker::new();
    let mut client = client(&broker, Arc::new(JsonCodec))
        .await
        .with_call_timeout(Some(Duration::from_millis(50)));

    let err = client.call(&json!({"n": 2})).await.unwrap_err();
    assert!(matches!(err, MessagingError::Timeout(d) if d == Duration::from_millis(50)));
    // the request still waits for a server
    assert_eq!(broker.queue_depth("SQUARES"), 1);
}

#[tokio::test]
async fn failing_handler_drops_the_request() {
    let broker = InMemoryBroker::new();
    let (shutdown, server) = serve(&broker, Arc::new(JsonCodec), square()).await;
    let mut client = client(&broker, Arc::new(JsonCodec)).await;

    let err = client
        .call_with_timeout(&json!({"x": 1}), Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::Timeout(_)));

    let nacks = broker.nacks();
    assert_eq!(nacks.len(), 1);
    assert!(!nacks[0].1);
    assert_eq!(broker.queue_depth("SQUARES"), 0);

    // the server keeps serving afterwards
    let raw = tokio::time::timeout(WAIT, client.call(&json!({"n": 6})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(raw, b"36");

    shutdown.shutdown();
    server.await.unwrap();
}

#[tokio::test]
async fn request_without_reply_to_is_dropped() {
    let broker = InMemoryBroker::new();
    let (shutdown, server) = serve(&broker, Arc::new(JsonCodec), square()).await;

    let sender = broker.connect(&guest_params()).await.unwrap();
    sender
        .publish("MATH", "SQUARES", br#"{"n":1}"#, &MessageProperties::default())
        .await
        .unwrap();

    for _ in 0..100 {
        if !broker.nacks().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(broker.nacks().len(), 1);
    assert!(broker.acks().is_empty());

    shutdown.shutdown();
    server.await.unwrap();
}

#[tokio::test]
async fn server_requires_a_handler() {
    let broker = InMemoryBroker::new();
    let err = RpcServer::builder(squares(), guest_params())
        .connector(Arc::new(broker.clone()))
        .build()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, MessagingError::Configuration(_)));
    assert_eq!(broker.connect_attempts(), 0);
}

#[tokio::test]
async fn scalar_replies_are_delivered() {
    let broker = InMemoryBroker::new();
    let truthy = handler_fn(|_| Ok(json!(true)));
    let (shutdown, server) = serve(&broker, Arc::new(JsonCodec), truthy).await;
    let mut client = client(&broker, Arc::new(JsonCodec)).await;

    let answer: bool = tokio::time::timeout(WAIT, client.call_as(&json!({"n": 1})))
        .await
        .unwrap()
        .unwrap();
    assert!(answer);
    assert!(broker.nacks().is_empty());
    assert_eq!(broker.acks().len(), 1);

    shutdown.shutdown();
    server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn timeout_covers_publish_backoff() {
    let broker = InMemoryBroker::new();
    let mut client = client(&broker, Arc::new(JsonCodec)).await;
    broker.fail_publishes(4);

    let started = Instant::now();
    let err = client
        .call_with_timeout(&json!({"n": 2}), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();

    assert!(matches!(err, MessagingError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
    assert!(broker.published_to("SQUARES").is_empty());
}

#[tokio::test]
async fn server_resumes_after_a_broker_disconnect() {
    let broker = InMemoryBroker::new();
    let mut server = RpcServer::builder(squares(), guest_params())
        .connector(Arc::new(broker.clone()))
        .handler(square())
        .reconnect_policy(ReconnectPolicy {
            retries: 3,
            delay: Duration::from_millis(10),
        })
        .build()
        .await
        .unwrap();
    let shutdown = server.shutdown_handle();
    let mut status = server.status();
    let listen = tokio::spawn(async move {
        let state = server.listen().await;
        (state, server.retries_left())
    });
    status
        .wait_for(|state| *state == ConsumerState::Consuming)
        .await
        .unwrap();

    broker.disconnect_all();

    let mut client = client(&broker, Arc::new(JsonCodec)).await;
    let answer: i64 = tokio::time::timeout(WAIT, client.call_as(&json!({"n": 7})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer, 49);

    shutdown.shutdown();
    let (state, retries_left) = listen.await.unwrap();
    assert_eq!(state, ConsumerState::Closed);
    assert_eq!(retries_left, 2);
}

#[tokio::test(start_paused = true)]
async fn server_goes_dormant_once_the_reconnect_budget_is_spent() {
    let broker = InMemoryBroker::new();
    let mut server = RpcServer::builder(squares(), guest_params())
        .connector(Arc::new(broker.clone()))
        .handler(square())
        .build()
        .await
        .unwrap();
    let status = server.status();
    let attempts_before = broker.connect_attempts();

    broker.fail_connects(u32::MAX);
    broker.disconnect_all();

    assert_eq!(server.listen().await, ConsumerState::Dormant);
    assert!(status.is_dormant());
    assert_eq!(server.retries_left(), 0);
    assert_eq!(broker.connect_attempts() - attempts_before, 4);
    assert_eq!(server.listen().await, ConsumerState::Dormant);
}
