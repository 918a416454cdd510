// relay-messaging-core/src/error.rs
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connectivity error: {0}")]
    Connectivity(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("unable to publish to {queue} after {attempts} attempts: {source}")]
    Publish {
        queue: String,
        attempts: u32,
        #[source]
        source: Box<MessagingError>,
    },

    #[error("message returned as unroutable: {0}")]
    Unroutable(String),

    #[error("connection closed by the broker: {0}")]
    Disconnected(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("security error: {0}")]
    Security(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl MessagingError {
    /// Transient broker-side failures that a retry or reconnect may cure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MessagingError::Broker(_)
                | MessagingError::Connectivity(_)
                | MessagingError::Disconnected(_)
        )
    }
}

pub type Result<T, E = MessagingError> = std::result::Result<T, E>;
