// relay-messaging-core/src/handler.rs
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{MessagingError, ReceivedMessage};

/// Processing function of a subscriber. `true` acknowledges the message,
/// `false` sends it down the failure path.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &ReceivedMessage) -> bool;
}

/// Request handler of an RPC server; the returned value becomes the reply.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: Value) -> Result<Value, MessagingError>;
}

struct FnProcessor<F>(F);

#[async_trait]
impl<F> MessageProcessor for FnProcessor<F>
where
    F: Fn(&ReceivedMessage) -> bool + Send + Sync,
{
    async fn process(&self, message: &ReceivedMessage) -> bool {
        (self.0)(message)
    }
}

/// Wraps a synchronous closure as a [`MessageProcessor`].
pub fn processor_fn<F>(f: F) -> Arc<dyn MessageProcessor>
where
    F: Fn(&ReceivedMessage) -> bool + Send + Sync + 'static,
{
    Arc::new(FnProcessor(f))
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> RpcHandler for FnHandler<F>
where
    F: Fn(Value) -> Result<Value, MessagingError> + Send + Sync,
{
    async fn handle(&self, request: Value) -> Result<Value, MessagingError> {
        (self.0)(request)
    }
}

/// Wraps a synchronous closure as an [`RpcHandler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn RpcHandler>
where
    F: Fn(Value) -> Result<Value, MessagingError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}
