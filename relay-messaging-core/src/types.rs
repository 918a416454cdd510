// relay-messaging-core/src/types.rs
use std::{collections::BTreeMap, fmt, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::MessagingError;

/// Marker carried by every dead-letter queue name.
pub const DEAD_LETTER_PREFIX: &str = "FAILED-";

/// AMQP delivery mode 2: the broker writes the message to disk.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// 24 hours, in milliseconds.
pub const DEFAULT_EXPIRATION_MS: u64 = 24 * 60 * 60 * 1000;

pub const DEFAULT_CONTENT_ENCODING: &str = "utf-8";

/// Queue + exchange pair a component is bound to.
///
/// Both names are upper-cased. The exchange is durable and direct-routed, the
/// queue is durable and bound with its own name as routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    queue: String,
    exchange: String,
}

impl Destination {
    pub fn new(queue: &str, exchange: &str) -> Result<Self, MessagingError> {
        let queue = queue.trim();
        let exchange = exchange.trim();
        if queue.is_empty() || exchange.is_empty() {
            return Err(MessagingError::Configuration(
                "queue and exchange names must not be empty".into(),
            ));
        }
        Ok(Self {
            queue: queue.to_uppercase(),
            exchange: exchange.to_uppercase(),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.queue
    }

    pub fn is_dead_letter(&self) -> bool {
        self.queue.contains(DEAD_LETTER_PREFIX)
    }

    /// Paired dead-letter destination on the same exchange, or `None` when
    /// this destination already is one.
    pub fn dead_letter(&self) -> Option<Destination> {
        if self.is_dead_letter() {
            return None;
        }
        Some(Destination {
            queue: format!("{}{}", DEAD_LETTER_PREFIX, self.queue),
            exchange: self.exchange.clone(),
        })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.queue, self.exchange)
    }
}

/// Per-message properties. Every field is optional so the same type serves as
/// defaults and as caller overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub delivery_mode: Option<u8>,
    /// TTL in milliseconds, string-encoded as AMQP expects.
    pub expiration: Option<String>,
    /// Epoch seconds.
    pub timestamp: Option<u64>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    /// Defaults applied to every published message.
    pub fn publish_defaults(content_type: &str) -> Self {
        Self {
            content_type: Some(content_type.to_string()),
            content_encoding: Some(DEFAULT_CONTENT_ENCODING.to_string()),
            delivery_mode: Some(PERSISTENT_DELIVERY_MODE),
            expiration: Some(DEFAULT_EXPIRATION_MS.to_string()),
            timestamp: Some(Utc::now().timestamp().max(0) as u64),
            ..Default::default()
        }
    }

    /// Parses overrides coming from an untyped source.
    pub fn from_json(value: Value) -> Result<Self, MessagingError> {
        if !value.is_object() {
            return Err(MessagingError::InvalidArgument(format!(
                "message properties must be a mapping, got {}",
                json_kind(&value)
            )));
        }
        serde_json::from_value(value).map_err(|e| MessagingError::InvalidArgument(e.to_string()))
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl.as_millis().to_string());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Overlays `overrides` on top of `self`; set fields of `overrides` win.
    pub fn merge(mut self, overrides: MessageProperties) -> Self {
        let MessageProperties {
            content_type,
            content_encoding,
            delivery_mode,
            expiration,
            timestamp,
            correlation_id,
            reply_to,
            message_id,
            headers,
        } = overrides;

        self.content_type = content_type.or(self.content_type);
        self.content_encoding = content_encoding.or(self.content_encoding);
        self.delivery_mode = delivery_mode.or(self.delivery_mode);
        self.expiration = expiration.or(self.expiration);
        self.timestamp = timestamp.or(self.timestamp);
        self.correlation_id = correlation_id.or(self.correlation_id);
        self.reply_to = reply_to.or(self.reply_to);
        self.message_id = message_id.or(self.message_id);
        self.headers.extend(headers);
        self
    }

    pub fn validate(&self) -> Result<(), MessagingError> {
        if let Some(expiration) = &self.expiration {
            if expiration.parse::<u64>().is_err() {
                return Err(MessagingError::InvalidArgument(format!(
                    "expiration must be a number of milliseconds, got {expiration:?}"
                )));
            }
        }
        if let Some(mode) = self.delivery_mode {
            if mode != 1 && mode != PERSISTENT_DELIVERY_MODE {
                return Err(MessagingError::InvalidArgument(format!(
                    "delivery mode must be 1 or 2, got {mode}"
                )));
            }
        }
        if matches!(self.reply_to.as_deref(), Some("")) {
            return Err(MessagingError::InvalidArgument(
                "reply_to must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

/// A message as handed over by the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Decoded payload plus delivery metadata, as seen by a processing function.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceivedMessage {
    pub data: Value,
    pub properties: MessageProperties,
    pub routing_key: String,
    pub redelivered: bool,
}
