// relay-messaging-core/src/publisher.rs
use std::sync::Arc;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{
    BrokerChannel, ConnectionParameters, Connector, Destination, EnvelopeCodec,
    MessageProperties, MessagingConfig, MessagingError, PublishRetryPolicy, RetryState, Topology,
};

/// Sends messages to one destination over a channel it owns.
pub struct Publisher {
    topology: Topology,
    params: ConnectionParameters,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn EnvelopeCodec>,
    retry_policy: PublishRetryPolicy,
    retry: RetryState,
    channel: Option<Arc<dyn BrokerChannel>>,
}

impl Publisher {
    /// Connects and declares the destination's exchange, queue and binding.
    pub async fn connect(
        destination: Destination,
        params: ConnectionParameters,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn EnvelopeCodec>,
    ) -> Result<Self, MessagingError> {
        let topology = Topology::new(destination);
        let channel = topology.establish(connector.as_ref(), &params).await?;
        let retry_policy = PublishRetryPolicy::default();

        Ok(Self {
            topology,
            params,
            connector,
            codec,
            retry_policy,
            retry: RetryState::new(retry_policy.max_attempts),
            channel: Some(channel),
        })
    }

    pub async fn from_config(
        destination: Destination,
        config: &MessagingConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, MessagingError> {
        Self::connect(destination, config.connection.clone(), connector, config.codec()?).await
    }

    pub fn with_retry_policy(mut self, policy: PublishRetryPolicy) -> Self {
        self.retry_policy = policy;
        self.retry = RetryState::new(policy.max_attempts);
        self
    }

    pub fn destination(&self) -> &Destination {
        self.topology.destination()
    }

    pub fn codec(&self) -> &Arc<dyn EnvelopeCodec> {
        &self.codec
    }

    pub fn retry_state(&self) -> RetryState {
        self.retry
    }

    /// Forgets failures of a publish that was abandoned mid-backoff.
    pub(crate) fn reset_retry(&mut self) {
        self.retry.reset();
    }

    pub async fn publish<T>(&mut self, payload: &T) -> Result<(), MessagingError>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.publish_with(payload, MessageProperties::default())
            .await
    }

    /// Encodes `payload` and publishes it with the default properties
    /// overlaid by `overrides`.
    pub async fn publish_with<T>(
        &mut self,
        payload: &T,
        overrides: MessageProperties,
    ) -> Result<(), MessagingError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let queue = self.topology.destination().queue().to_string();

        if let Err(err) = overrides.validate() {
            error!(queue = %queue, error = %err, "invalid message properties");
            return Err(err);
        }

        let body = self.codec.encode(payload).inspect_err(|err| {
            error!(queue = %queue, error = %err, "unable to encode message");
        })?;
        let properties =
            MessageProperties::publish_defaults(self.codec.content_type()).merge(overrides);

        self.publish_raw(&queue, &body, &properties).await?;
        info!(queue = %queue, bytes = body.len(), "message sent");
        Ok(())
    }

    /// Publishes already-encoded bytes on the destination exchange.
    ///
    /// Broker-level failures are retried, waiting `base_delay * attempt`
    /// between attempts; once the ceiling is reached the last error is
    /// wrapped in [`MessagingError::Publish`].
    pub async fn publish_raw(
        &mut self,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), MessagingError> {
        loop {
            let err = match self.try_publish(routing_key, body, properties).await {
                Ok(()) => {
                    self.retry.reset();
                    return Ok(());
                }
                Err(err) if err.is_retryable() => err,
                Err(err) => {
                    error!(routing_key, error = %err, "publish rejected");
                    return Err(err);
                }
            };

            let attempt = self.retry.record_failure();
            if self.retry.exhausted() {
                self.retry.reset();
                let err = MessagingError::Publish {
                    queue: routing_key.to_string(),
                    attempts: attempt,
                    source: Box::new(err),
                };
                error!(error = %err, "giving up on publish");
                return Err(err);
            }

            let wait = self.retry_policy.delay_for(attempt);
            warn!(
                routing_key,
                attempt,
                wait = ?wait,
                error = %err,
                "publish failed, retrying"
            );
            sleep(wait).await;
        }
    }

    async fn try_publish(
        &mut self,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), MessagingError> {
        let channel = self.channel().await?;
        channel
            .publish(
                self.topology.destination().exchange(),
                routing_key,
                body,
                properties,
            )
            .await
    }

    /// The owned channel, reconnecting first if it was closed.
    pub(crate) async fn channel(&mut self) -> Result<Arc<dyn BrokerChannel>, MessagingError> {
        if let Some(channel) = self.channel.as_ref().filter(|c| c.is_open()) {
            return Ok(Arc::clone(channel));
        }
        self.channel = None;

        debug!(
            queue = self.topology.destination().queue(),
            "channel closed, reconnecting publisher"
        );
        let channel = self
            .topology
            .establish(self.connector.as_ref(), &self.params)
            .await?;
        self.channel = Some(Arc::clone(&channel));
        Ok(channel)
    }

    pub async fn close(&mut self) -> Result<(), MessagingError> {
        match self.channel.take() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}
