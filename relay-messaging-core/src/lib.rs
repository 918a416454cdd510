pub mod broker;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod publisher;
pub mod retry;
pub mod rpc;
pub mod security;
pub mod subscriber;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod topology;
pub mod types;

pub use broker::{BrokerChannel, Connector, DeliveryStream};
pub use codec::{EnvelopeCodec, JsonCodec, SecureCodec};
pub use config::{ConnectionParameters, ConnectionParametersBuilder, MessagingConfig};
pub use consumer::{ConsumerState, ShutdownHandle, StatusHandle};
pub use error::MessagingError;
pub use handler::{handler_fn, processor_fn, MessageProcessor, RpcHandler};
pub use publisher::Publisher;
pub use retry::{PublishRetryPolicy, ReconnectPolicy, RetryState};
pub use rpc::{RpcClient, RpcServer, RpcServerBuilder};
pub use security::MessageCipher;
pub use subscriber::{FailurePolicy, Subscriber, SubscriberBuilder};
pub use topology::Topology;
pub use types::{
    Delivery, Destination, MessageProperties, ReceivedMessage, DEAD_LETTER_PREFIX,
    DEFAULT_EXPIRATION_MS, PERSISTENT_DELIVERY_MODE,
};
