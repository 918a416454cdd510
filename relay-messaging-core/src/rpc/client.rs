// relay-messaging-core/src/rpc/client.rs
use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    topology::declare_reply_queue, BrokerChannel, ConnectionParameters, Connector,
    DeliveryStream, Destination, EnvelopeCodec, MessageProperties, MessagingError, Publisher,
};

/// Sends requests to one destination and waits for correlated replies on a
/// private queue.
pub struct RpcClient {
    publisher: Publisher,
    reply_channel: Arc<dyn BrokerChannel>,
    reply_queue: String,
    replies: DeliveryStream,
    call_timeout: Option<Duration>,
}

impl RpcClient {
    /// Declares the request topology plus an exclusive reply queue consumed
    /// with auto-acknowledge.
    pub async fn connect(
        destination: Destination,
        params: ConnectionParameters,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn EnvelopeCodec>,
    ) -> Result<Self, MessagingError> {
        let mut publisher = Publisher::connect(destination, params, connector, codec).await?;
        let reply_channel = publisher.channel().await?;
        let (reply_queue, replies) =
            open_replies(reply_channel.as_ref(), publisher.destination().exchange()).await?;

        info!(
            queue = publisher.destination().queue(),
            reply_queue = %reply_queue,
            "rpc client ready"
        );
        Ok(Self {
            publisher,
            reply_channel,
            reply_queue,
            replies,
            call_timeout: None,
        })
    }

    /// Default timeout of [`RpcClient::call`]; `None` waits forever.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    pub fn destination(&self) -> &Destination {
        self.publisher.destination()
    }

    /// Publishes `request` and returns the raw body of the matching reply.
    pub async fn call<T>(&mut self, request: &T) -> Result<Vec<u8>, MessagingError>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.call_with_timeout(request, self.call_timeout).await
    }

    /// `timeout` bounds the whole call: reconnecting, publishing (including
    /// publish backoff) and waiting for the reply.
    pub async fn call_with_timeout<T>(
        &mut self,
        request: &T,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, MessagingError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let correlation_id = Uuid::new_v4().to_string();
        let Some(limit) = timeout else {
            return self.send_and_wait(request, &correlation_id).await;
        };

        match tokio::time::timeout(limit, self.send_and_wait(request, &correlation_id)).await {
            Ok(reply) => reply,
            Err(_) => {
                warn!(correlation_id = %correlation_id, "rpc call timed out");
                self.publisher.reset_retry();
                Err(MessagingError::Timeout(limit))
            }
        }
    }

    async fn send_and_wait<T>(
        &mut self,
        request: &T,
        correlation_id: &str,
    ) -> Result<Vec<u8>, MessagingError>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.ensure_replies().await?;

        let properties = MessageProperties::default()
            .with_reply_to(self.reply_queue.clone())
            .with_correlation_id(correlation_id);
        self.publisher.publish_with(request, properties).await?;
        debug!(correlation_id, "request sent, waiting for reply");

        wait_for_reply(&mut self.replies, correlation_id).await
    }

    /// [`RpcClient::call`] followed by decoding the reply.
    pub async fn call_as<T, R>(&mut self, request: &T) -> Result<R, MessagingError>
    where
        T: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let body = self.call(request).await?;
        self.publisher.codec().decode(&body)
    }

    pub async fn close(&mut self) -> Result<(), MessagingError> {
        self.publisher.close().await
    }

    /// The reply queue is exclusive to its connection; after the publisher
    /// reconnected a new one is declared.
    async fn ensure_replies(&mut self) -> Result<(), MessagingError> {
        let channel = self.publisher.channel().await?;
        if Arc::ptr_eq(&channel, &self.reply_channel) {
            return Ok(());
        }

        let (reply_queue, replies) =
            open_replies(channel.as_ref(), self.publisher.destination().exchange()).await?;
        warn!(
            old = %self.reply_queue,
            new = %reply_queue,
            "reply queue re-declared after reconnect"
        );
        self.reply_channel = channel;
        self.reply_queue = reply_queue;
        self.replies = replies;
        Ok(())
    }
}

async fn open_replies(
    channel: &dyn BrokerChannel,
    exchange: &str,
) -> Result<(String, DeliveryStream), MessagingError> {
    let queue = declare_reply_queue(channel, exchange).await?;
    let replies = channel.consume(&queue, true).await?;
    Ok((queue, replies))
}

/// Replies carrying another correlation id are stale and dropped.
async fn wait_for_reply(
    replies: &mut DeliveryStream,
    correlation_id: &str,
) -> Result<Vec<u8>, MessagingError> {
    while let Some(reply) = replies.next().await {
        let reply = reply?;
        if reply.properties.correlation_id.as_deref() == Some(correlation_id) {
            return Ok(reply.body);
        }
        debug!(
            expected = correlation_id,
            received = ?reply.properties.correlation_id,
            "discarding unmatched reply"
        );
    }
    Err(MessagingError::Disconnected(
        "reply stream closed before a reply arrived".into(),
    ))
}
