// relay-messaging-core/src/subscriber.rs
use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{debug, error, warn};

use crate::{
    consumer::{ConsumeLoop, DeliveryHandler},
    BrokerChannel, ConnectionParameters, Connector, ConsumerState, Delivery, Destination,
    EnvelopeCodec, JsonCodec, MessageProcessor, MessagingConfig, MessagingError, ReceivedMessage,
    ReconnectPolicy, ShutdownHandle, StatusHandle, Topology,
};

/// What happens to a message whose processing failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Nack without requeue and republish to `FAILED-<queue>`. On a
    /// dead-letter queue itself the message is rejected with requeue.
    #[default]
    DeadLetter,
    /// Nack with requeue on the same queue.
    Requeue,
}

pub struct SubscriberBuilder {
    destination: Destination,
    params: ConnectionParameters,
    connector: Option<Arc<dyn Connector>>,
    codec: Arc<dyn EnvelopeCodec>,
    processor: Option<Arc<dyn MessageProcessor>>,
    failure_policy: FailurePolicy,
    reconnect: ReconnectPolicy,
    shutdown: ShutdownHandle,
}

impl SubscriberBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn EnvelopeCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn processor(mut self, processor: Arc<dyn MessageProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn shutdown_handle(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Validates the configuration, connects and declares the topology.
    pub async fn build(self) -> Result<Subscriber, MessagingError> {
        let connector = self.connector.ok_or_else(|| {
            MessagingError::Configuration("a broker connector is required".into())
        })?;
        let processor = self.processor.ok_or_else(|| {
            MessagingError::Configuration("a message processor is required".into())
        })?;

        let mut topology = Topology::new(self.destination);
        if self.failure_policy == FailurePolicy::DeadLetter {
            topology = topology.with_dead_letter();
        }

        let dispatch = MessageDispatch {
            queue: topology.destination().queue().to_string(),
            dead_letter: topology.dead_letter().cloned(),
            failure_policy: self.failure_policy,
            codec: self.codec,
            processor,
            pending: Mutex::new(Vec::new()),
        };
        let consumer =
            ConsumeLoop::connect(topology, self.params, connector, self.reconnect, self.shutdown)
                .await?;

        Ok(Subscriber { consumer, dispatch })
    }
}

/// Consumes one destination and feeds every message to a
/// [`MessageProcessor`].
pub struct Subscriber {
    consumer: ConsumeLoop,
    dispatch: MessageDispatch,
}

impl Subscriber {
    pub fn builder(destination: Destination, params: ConnectionParameters) -> SubscriberBuilder {
        SubscriberBuilder {
            destination,
            params,
            connector: None,
            codec: Arc::new(JsonCodec),
            processor: None,
            failure_policy: FailurePolicy::default(),
            reconnect: ReconnectPolicy::default(),
            shutdown: ShutdownHandle::new(),
        }
    }

    /// Builder preloaded with connection parameters, codec and reconnect
    /// budget from `config`.
    pub fn builder_from_config(
        destination: Destination,
        config: &MessagingConfig,
    ) -> Result<SubscriberBuilder, MessagingError> {
        let reconnect = ReconnectPolicy {
            retries: config.connection_closed_retry,
            ..ReconnectPolicy::default()
        };
        Ok(Self::builder(destination, config.connection.clone())
            .codec(config.codec()?)
            .reconnect_policy(reconnect))
    }

    /// Consumes until shutdown or until the reconnect budget is exhausted and
    /// returns the terminal state ([`ConsumerState::Closed`] or
    /// [`ConsumerState::Dormant`]).
    pub async fn consume(&mut self) -> ConsumerState {
        self.consumer.run(&self.dispatch).await
    }

    pub fn destination(&self) -> &Destination {
        self.consumer.topology().destination()
    }

    pub fn dead_letter(&self) -> Option<&Destination> {
        self.consumer.topology().dead_letter()
    }

    pub fn state(&self) -> ConsumerState {
        self.consumer.state()
    }

    pub fn status(&self) -> StatusHandle {
        self.consumer.status()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.consumer.shutdown_handle()
    }

    pub fn retries_left(&self) -> u32 {
        self.consumer.retries_left()
    }
}

struct MessageDispatch {
    queue: String,
    dead_letter: Option<Destination>,
    failure_policy: FailurePolicy,
    codec: Arc<dyn EnvelopeCodec>,
    processor: Arc<dyn MessageProcessor>,
    /// Failed messages already nacked whose reroute hit a broken channel;
    /// republished once the consumer has a new one.
    pending: Mutex<Vec<Delivery>>,
}

impl MessageDispatch {
    fn pending(&self) -> MutexGuard<'_, Vec<Delivery>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn reroute(
        &self,
        channel: &dyn BrokerChannel,
        dead_letter: &Destination,
        delivery: &Delivery,
    ) -> Result<(), MessagingError> {
        channel
            .publish(
                dead_letter.exchange(),
                dead_letter.routing_key(),
                &delivery.body,
                &delivery.properties,
            )
            .await
    }

    /// Decode failures and processor panics count as a failed message.
    async fn process(&self, delivery: &Delivery) -> bool {
        let data = match self.codec.decode_value(&delivery.body) {
            Ok(data) => data,
            Err(err) => {
                error!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %err,
                    "unable to decode message"
                );
                return false;
            }
        };
        let message = ReceivedMessage {
            data,
            properties: delivery.properties.clone(),
            routing_key: delivery.routing_key.clone(),
            redelivered: delivery.redelivered,
        };

        match AssertUnwindSafe(self.processor.process(&message))
            .catch_unwind()
            .await
        {
            Ok(processed) => processed,
            Err(_) => {
                error!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    "message processor panicked"
                );
                false
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for MessageDispatch {
    async fn handle(
        &self,
        channel: &dyn BrokerChannel,
        delivery: Delivery,
    ) -> Result<(), MessagingError> {
        let tag = delivery.delivery_tag;

        if self.process(&delivery).await {
            channel.ack(tag).await?;
            debug!(queue = %self.queue, delivery_tag = tag, "done processing");
            return Ok(());
        }

        match (self.failure_policy, &self.dead_letter) {
            (FailurePolicy::DeadLetter, Some(dead_letter)) => {
                channel.nack(tag, false).await?;
                if let Err(err) = self.reroute(channel, dead_letter, &delivery).await {
                    error!(
                        queue = %self.queue,
                        dead_letter = dead_letter.queue(),
                        error = %err,
                        "unable to reroute failed message"
                    );
                    if err.is_retryable() {
                        self.pending().push(delivery);
                        return Err(err);
                    }
                    return Ok(());
                }
                error!(
                    queue = %self.queue,
                    delivery_tag = tag,
                    dead_letter = dead_letter.queue(),
                    "processing failed, requeued to dead-letter queue"
                );
            }
            (FailurePolicy::DeadLetter, None) => {
                channel.reject(tag, true).await?;
                error!(
                    queue = %self.queue,
                    delivery_tag = tag,
                    "processing failed, returned to dead-letter queue"
                );
            }
            (FailurePolicy::Requeue, _) => {
                channel.nack(tag, true).await?;
                warn!(
                    queue = %self.queue,
                    delivery_tag = tag,
                    "could not process message, requeued"
                );
            }
        }
        Ok(())
    }

    async fn on_channel(&self, channel: &dyn BrokerChannel) -> Result<(), MessagingError> {
        let Some(dead_letter) = &self.dead_letter else {
            return Ok(());
        };
        let mut pending = std::mem::take(&mut *self.pending());
        if pending.is_empty() {
            return Ok(());
        }

        warn!(
            queue = %self.queue,
            count = pending.len(),
            "rerouting failed messages left over from the previous channel"
        );
        while let Some(delivery) = pending.first() {
            if let Err(err) = self.reroute(channel, dead_letter, delivery).await {
                if err.is_retryable() {
                    self.pending().extend(pending);
                    return Err(err);
                }
                error!(
                    queue = %self.queue,
                    dead_letter = dead_letter.queue(),
                    error = %err,
                    "dropping failed message that cannot be rerouted"
                );
            }
            pending.remove(0);
        }
        Ok(())
    }
}
