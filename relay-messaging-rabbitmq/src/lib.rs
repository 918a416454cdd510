//! RabbitMQ adapter for `relay-messaging-core`, built on `lapin`.
//!
//! [`RabbitConnector`] implements the core broker seam; the functions below
//! wire it into the core components from a [`MessagingConfig`].

mod channel;
mod connector;
mod properties;

use std::sync::Arc;

use relay_messaging_core::{
    Destination, MessagingConfig, MessagingError, Publisher, RpcClient, RpcServer,
    RpcServerBuilder, Subscriber, SubscriberBuilder,
};

pub use channel::RabbitChannel;
pub use connector::RabbitConnector;

/// Connects a publisher for `destination` using `config`.
pub async fn publisher(
    destination: Destination,
    config: &MessagingConfig,
) -> Result<Publisher, MessagingError> {
    Publisher::from_config(destination, config, Arc::new(RabbitConnector::new())).await
}

/// Subscriber builder preloaded with the RabbitMQ connector, the configured
/// codec and the configured restart budget. Set a processor and call
/// `build()`.
pub fn subscriber(
    destination: Destination,
    config: &MessagingConfig,
) -> Result<SubscriberBuilder, MessagingError> {
    Ok(Subscriber::builder_from_config(destination, config)?
        .connector(Arc::new(RabbitConnector::new())))
}

pub async fn rpc_client(
    destination: Destination,
    config: &MessagingConfig,
) -> Result<RpcClient, MessagingError> {
    RpcClient::connect(
        destination,
        config.connection.clone(),
        Arc::new(RabbitConnector::new()),
        config.codec()?,
    )
    .await
}

/// Like [`subscriber`], for an RPC server.
pub fn rpc_server(
    destination: Destination,
    config: &MessagingConfig,
) -> Result<RpcServerBuilder, MessagingError> {
    Ok(RpcServer::builder_from_config(destination, config)?
        .connector(Arc::new(RabbitConnector::new())))
}
