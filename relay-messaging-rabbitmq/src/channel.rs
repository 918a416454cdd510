use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::BasicReturnMessage, options::*, publisher_confirm::Confirmation, types::FieldTable,
    Channel, Connection, ExchangeKind,
};
use relay_messaging_core::{
    BrokerChannel, Delivery, DeliveryStream, MessageProperties, MessagingError,
};
use tracing::{debug, warn};

use crate::properties::{from_amqp, to_amqp};

const REPLY_SUCCESS: u16 = 200;

/// One AMQP channel on a connection it owns. Publisher confirms are enabled
/// at creation so every publish waits for the broker's verdict.
pub struct RabbitChannel {
    connection: Connection,
    channel: Channel,
    confirm_timeout: Duration,
}

impl RabbitChannel {
    pub(crate) fn new(connection: Connection, channel: Channel, confirm_timeout: Duration) -> Self {
        Self {
            connection,
            channel,
            confirm_timeout,
        }
    }
}

fn broker(e: lapin::Error) -> MessagingError {
    MessagingError::Broker(e.to_string())
}

fn returned(
    exchange: &str,
    routing_key: &str,
    message: Option<Box<BasicReturnMessage>>,
) -> MessagingError {
    let reason = message
        .map(|m| format!("{} {}", m.reply_code, m.reply_text.as_str()))
        .unwrap_or_else(|| "returned".into());
    MessagingError::Unroutable(format!(
        "message to '{exchange}' with key '{routing_key}' was returned: {reason}"
    ))
}

#[async_trait]
impl BrokerChannel for RabbitChannel {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<(), MessagingError> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker)
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), MessagingError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(broker)
    }

    async fn declare_reply_queue(&self) -> Result<String, MessagingError> {
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), MessagingError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                body,
                to_amqp(properties),
            )
            .await
            .map_err(broker)?;

        let confirmation = tokio::time::timeout(self.confirm_timeout, confirm)
            .await
            .map_err(|_| {
                MessagingError::Disconnected(format!(
                    "no publisher confirm within {:?}, connection blocked",
                    self.confirm_timeout
                ))
            })?
            .map_err(broker)?;

        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(message)) => Err(returned(exchange, routing_key, Some(message))),
            Confirmation::Nack(Some(message)) => Err(returned(exchange, routing_key, Some(message))),
            Confirmation::Nack(None) => Err(MessagingError::Broker(
                "publisher confirm NACK".to_string(),
            )),
        }
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream, MessagingError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker)?;
        let tag = consumer.tag();
        debug!(queue, consumer_tag = tag.as_str(), "consumer registered");

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|d| Delivery {
                        delivery_tag: d.delivery_tag,
                        routing_key: d.routing_key.as_str().to_string(),
                        redelivered: d.redelivered,
                        properties: from_amqp(&d.properties),
                        body: d.data,
                    })
                    .map_err(|e| MessagingError::Disconnected(e.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(broker)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(broker)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(broker)
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(REPLY_SUCCESS, "OK").await {
                warn!(error = %e, "channel close failed");
            }
        }
        if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "OK")
                .await
                .map_err(broker)?;
        }
        Ok(())
    }
}
