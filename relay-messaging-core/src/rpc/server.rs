// relay-messaging-core/src/rpc/server.rs
use std::{panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{debug, error, info, warn};

use crate::{
    consumer::{ConsumeLoop, DeliveryHandler},
    BrokerChannel, ConnectionParameters, Connector, ConsumerState, Delivery, Destination,
    EnvelopeCodec, JsonCodec, MessageProperties, MessagingConfig, MessagingError,
    ReconnectPolicy, RpcHandler, ShutdownHandle, StatusHandle, Topology,
};

pub struct RpcServerBuilder {
    destination: Destination,
    params: ConnectionParameters,
    connector: Option<Arc<dyn Connector>>,
    codec: Arc<dyn EnvelopeCodec>,
    handler: Option<Arc<dyn RpcHandler>>,
    reconnect: ReconnectPolicy,
    shutdown: ShutdownHandle,
}

impl RpcServerBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn EnvelopeCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn RpcHandler>) -> Self {
        self.handler = Some(handler);
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

    pub async fn build(self) -> Result<RpcServer, MessagingError> {
        let connector = self.connector.ok_or_else(|| {
            MessagingError::Configuration("a broker connector is required".into())
        })?;
        let handler = self.handler.ok_or_else(|| {
            MessagingError::Configuration("an rpc handler is required".into())
        })?;

        let topology = Topology::new(self.destination);
        let dispatch = RequestDispatch {
            queue: topology.destination().queue().to_string(),
            exchange: topology.destination().exchange().to_string(),
            codec: self.codec,
            handler,
        };
        let consumer =
            ConsumeLoop::connect(topology, self.params, connector, self.reconnect, self.shutdown)
                .await?;

        Ok(RpcServer { consumer, dispatch })
    }
}

/// Answers requests arriving on one destination.
pub struct RpcServer {
    consumer: ConsumeLoop,
    dispatch: RequestDispatch,
}

impl RpcServer {
    pub fn builder(destination: Destination, params: ConnectionParameters) -> RpcServerBuilder {
        RpcServerBuilder {
            destination,
            params,
            connector: None,
            codec: Arc::new(JsonCodec),
            handler: None,
            reconnect: ReconnectPolicy::default(),
            shutdown: ShutdownHandle::new(),
        }
    }

    pub fn builder_from_config(
        destination: Destination,
        config: &MessagingConfig,
    ) -> Result<RpcServerBuilder, MessagingError> {
        let reconnect = ReconnectPolicy {
            retries: config.connection_closed_retry,
            ..ReconnectPolicy::default()
        };
        Ok(Self::builder(destination, config.connection.clone())
            .codec(config.codec()?)
            .reconnect_policy(reconnect))
    }

    /// Serves requests until shutdown or until the reconnect budget is
    /// exhausted; returns the terminal state.
    pub async fn listen(&mut self) -> ConsumerState {
        info!(queue = %self.dispatch.queue, "awaiting rpc requests");
        self.consumer.run(&self.dispatch).await
    }

    pub fn destination(&self) -> &Destination {
        self.consumer.topology().destination()
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

struct RequestDispatch {
    queue: String,
    exchange: String,
    codec: Arc<dyn EnvelopeCodec>,
    handler: Arc<dyn RpcHandler>,
}

impl RequestDispatch {
    async fn respond(&self, delivery: &Delivery) -> Result<Vec<u8>, MessagingError> {
        let request = self.codec.decode_value(&delivery.body)?;
        debug!(queue = %self.queue, request = %request, "handling request");

        let response = AssertUnwindSafe(self.handler.handle(request))
            .catch_unwind()
            .await
            .map_err(|_| MessagingError::Handler("rpc handler panicked".into()))??;

        self.codec.encode_any(&response)
    }
}

#[async_trait]
impl DeliveryHandler for RequestDispatch {
    async fn handle(
        &self,
        channel: &dyn BrokerChannel,
        delivery: Delivery,
    ) -> Result<(), MessagingError> {
        let tag = delivery.delivery_tag;
        let correlation_id = delivery.properties.correlation_id.clone();

        let Some(reply_to) = delivery
            .properties
            .reply_to
            .clone()
            .filter(|r| !r.is_empty())
        else {
            warn!(queue = %self.queue, delivery_tag = tag, "request without reply_to, dropping");
            return channel.nack(tag, false).await;
        };

        let body = match self.respond(&delivery).await {
            Ok(body) => body,
            Err(err) => {
                error!(
                    queue = %self.queue,
                    delivery_tag = tag,
                    correlation_id = ?correlation_id,
                    error = %err,
                    "unable to answer request"
                );
                return channel.nack(tag, false).await;
            }
        };

        let properties = MessageProperties {
            content_type: Some(self.codec.content_type().to_string()),
            correlation_id: correlation_id.clone(),
            ..Default::default()
        };
        match channel
            .publish(&self.exchange, &reply_to, &body, &properties)
            .await
        {
            Ok(()) => {
                info!(reply_to = %reply_to, correlation_id = ?correlation_id, "responded to request")
            }
            Err(err) if err.is_retryable() => return Err(err),
            Err(err) => {
                warn!(reply_to = %reply_to, error = %err, "reply could not be delivered");
            }
        }
        channel.ack(tag).await
    }
}
