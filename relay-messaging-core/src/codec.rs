// relay-messaging-core/src/codec.rs
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::{security::MessageCipher, MessagingError};

/// Turns payloads into transport bytes and back.
///
/// Implementations work on [`serde_json::Value`] so the trait stays object
/// safe; the typed helpers live on `dyn EnvelopeCodec`.
pub trait EnvelopeCodec: Send + Sync {
    fn content_type(&self) -> &'static str;

    /// Encodes any JSON value, scalars included. RPC replies go through
    /// here.
    fn encode_any(&self, value: &Value) -> Result<Vec<u8>, MessagingError>;

    /// Encodes a published payload; see [`ensure_supported`].
    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, MessagingError> {
        ensure_supported(value)?;
        self.encode_any(value)
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Value, MessagingError>;
}

impl dyn EnvelopeCodec {
    pub fn encode<T: Serialize + ?Sized>(&self, payload: &T) -> Result<Vec<u8>, MessagingError> {
        let value = serde_json::to_value(payload)
            .map_err(|e| MessagingError::Serialization(e.to_string()))?;
        self.encode_value(&value)
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, MessagingError> {
        let value = self.decode_value(bytes)?;
        serde_json::from_value(value).map_err(|e| MessagingError::Serialization(e.to_string()))
    }
}

/// Only mappings, sequences, strings and integers travel as top-level
/// payloads.
pub fn ensure_supported(value: &Value) -> Result<(), MessagingError> {
    let supported = match value {
        Value::Object(_) | Value::Array(_) | Value::String(_) => true,
        Value::Number(n) => n.is_i64() || n.is_u64(),
        Value::Null | Value::Bool(_) => false,
    };
    if supported {
        Ok(())
    } else {
        Err(MessagingError::Serialization(format!(
            "{value} is not in supported types (mapping, sequence, string, integer)"
        )))
    }
}

/// Plain UTF-8 JSON, no encryption.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl EnvelopeCodec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode_any(&self, value: &Value) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(value).map_err(|e| MessagingError::Serialization(e.to_string()))
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Value, MessagingError> {
        serde_json::from_slice(bytes).map_err(|e| MessagingError::Serialization(e.to_string()))
    }
}

/// MessagePack, then sealed with [`MessageCipher`].
///
/// Encoding serializes first and encrypts the serialized bytes; decoding
/// decrypts first.
#[derive(Debug, Clone)]
pub struct SecureCodec {
    cipher: MessageCipher,
}

impl SecureCodec {
    pub fn new(cipher: MessageCipher) -> Self {
        Self { cipher }
    }
}

impl EnvelopeCodec for SecureCodec {
    fn content_type(&self) -> &'static str {
        "application/x-msgpack+xchacha20poly1305"
    }

    fn encode_any(&self, value: &Value) -> Result<Vec<u8>, MessagingError> {
        let packed = rmp_serde::to_vec_named(value)
            .map_err(|e| MessagingError::Serialization(e.to_string()))?;
        self.cipher.encrypt(&packed)
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Value, MessagingError> {
        let packed = self.cipher.decrypt(bytes)?;
        rmp_serde::from_slice(&packed).map_err(|e| MessagingError::Serialization(e.to_string()))
    }
}
