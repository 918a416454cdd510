// relay-messaging-core/src/topology.rs
use std::sync::Arc;

use tracing::{debug, info};

use crate::{BrokerChannel, ConnectionParameters, Connector, Destination, MessagingError};

/// Exchange, queue and bindings a component expects to exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    destination: Destination,
    dead_letter: Option<Destination>,
}

impl Topology {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            dead_letter: None,
        }
    }

    /// Adds the paired dead-letter queue, unless the destination already is
    /// one.
    pub fn with_dead_letter(mut self) -> Self {
        self.dead_letter = self.destination.dead_letter();
        self
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn dead_letter(&self) -> Option<&Destination> {
        self.dead_letter.as_ref()
    }

    /// Connects, opens a channel and declares the topology on it.
    pub async fn establish(
        &self,
        connector: &dyn Connector,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn BrokerChannel>, MessagingError> {
        debug!(
            host = params.host(),
            port = params.port(),
            vhost = params.vhost(),
            "connecting to broker"
        );
        let channel = connector.connect(params).await.map_err(connectivity)?;
        self.declare(channel.as_ref()).await?;
        Ok(channel)
    }

    /// Idempotent: repeating it against an existing topology is a no-op.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<(), MessagingError> {
        let exchange = self.destination.exchange();

        channel
            .declare_exchange(exchange)
            .await
            .map_err(connectivity)?;
        declare_bound_queue(channel, &self.destination).await?;

        if let Some(dead_letter) = &self.dead_letter {
            declare_bound_queue(channel, dead_letter).await?;
        }

        info!(
            queue = self.destination.queue(),
            exchange,
            dead_letter = self.dead_letter.as_ref().map(|d| d.queue()),
            "topology declared"
        );
        Ok(())
    }
}

async fn declare_bound_queue(
    channel: &dyn BrokerChannel,
    destination: &Destination,
) -> Result<(), MessagingError> {
    channel
        .declare_queue(destination.queue())
        .await
        .map_err(connectivity)?;
    channel
        .bind_queue(
            destination.queue(),
            destination.exchange(),
            destination.routing_key(),
        )
        .await
        .map_err(connectivity)
}

/// Declares an exclusive broker-named queue bound to `exchange` under its own
/// name, for RPC replies.
pub async fn declare_reply_queue(
    channel: &dyn BrokerChannel,
    exchange: &str,
) -> Result<String, MessagingError> {
    let queue = channel.declare_reply_queue().await.map_err(connectivity)?;
    channel
        .bind_queue(&queue, exchange, &queue)
        .await
        .map_err(connectivity)?;
    debug!(queue = %queue, exchange, "reply queue declared");
    Ok(queue)
}

fn connectivity(err: MessagingError) -> MessagingError {
    match err {
        MessagingError::Connectivity(_) | MessagingError::Configuration(_) => err,
        other => MessagingError::Connectivity(other.to_string()),
    }
}
