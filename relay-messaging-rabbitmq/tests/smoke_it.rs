//! Runs against a live broker configured through the `RABBIT_*` variables:
//! `cargo test -p relay-messaging-rabbitmq -- --ignored`.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use relay_messaging_core::{
    handler_fn, processor_fn, ConsumerState, Destination, MessagingConfig, MessagingError,
};
use serde_json::{json, Value};
use uuid::Uuid;

fn unique(prefix: &str) -> Destination {
    let suffix = Uuid::new_v4().simple().to_string();
    Destination::new(&format!("{prefix}-{suffix}"), "relay.it").unwrap()
}

#[tokio::test]
#[ignore = "needs a running RabbitMQ"]
async fn publish_and_receive() -> Result<(), Box<dyn std::error::Error>> {
    let config = MessagingConfig::from_env()?;
    let destination = unique("it");

    let mut publisher = relay_messaging_rabbitmq::publisher(destination.clone(), &config).await?;
    publisher.publish(&json!({"ok": true})).await?;

    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let mut subscriber = relay_messaging_rabbitmq::subscriber(destination, &config)?
        .processor(processor_fn(move |message| {
            *sink.lock().unwrap() = Some(message.data.clone());
            true
        }))
        .build()
        .await?;
    let shutdown = subscriber.shutdown_handle();
    let consume = tokio::spawn(async move { subscriber.consume().await });

    for _ in 0..50 {
        if seen.lock().unwrap().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    shutdown.shutdown();

    assert_eq!(consume.await?, ConsumerState::Closed);
    assert_eq!(*seen.lock().unwrap(), Some(json!({"ok": true})));
    publisher.close().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "needs a running RabbitMQ"]
async fn rpc_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let config = MessagingConfig::from_env()?;
    let destination = unique("rpc");

    let mut server = relay_messaging_rabbitmq::rpc_server(destination.clone(), &config)?
        .handler(handler_fn(|request: Value| {
            let n = request["n"]
                .as_i64()
                .ok_or_else(|| MessagingError::Handler("missing n".into()))?;
            Ok(json!(n * n))
        }))
        .build()
        .await?;
    let shutdown = server.shutdown_handle();
    let listen = tokio::spawn(async move { server.listen().await });

    let mut client = relay_messaging_rabbitmq::rpc_client(destination, &config)
        .await?
        .with_call_timeout(Some(Duration::from_secs(5)));
    let answer: i64 = client.call_as(&json!({"n": 4})).await?;
    assert_eq!(answer, 16);

    shutdown.shutdown();
    assert_eq!(listen.await?, ConsumerState::Closed);
    client.close().await?;
    Ok(())
}
