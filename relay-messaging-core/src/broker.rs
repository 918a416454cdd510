// relay-messaging-core/src/broker.rs
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::{ConnectionParameters, Delivery, MessageProperties, MessagingError};

/// Deliveries of one consumer. The stream ends (or yields an error) when the
/// broker closes the channel.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, MessagingError>>;

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects and opens one channel on the new connection.
    async fn connect(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn BrokerChannel>, MessagingError>;
}

/// The operations the protocol needs from one broker channel.
///
/// Exchanges are always durable and direct-routed; named queues are always
/// durable.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, exchange: &str) -> Result<(), MessagingError>;

    async fn declare_queue(&self, queue: &str) -> Result<(), MessagingError>;

    /// Exclusive queue named by the broker; returns the generated name.
    async fn declare_reply_queue(&self) -> Result<String, MessagingError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError>;

    /// Publishes with the mandatory flag set. An unroutable message fails
    /// with [`MessagingError::Unroutable`].
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), MessagingError>;

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream, MessagingError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError>;

    /// Closes the channel and its connection.
    async fn close(&self) -> Result<(), MessagingError>;
}
