//! Conversion between [`MessageProperties`] and AMQP basic properties.

use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use relay_messaging_core::MessageProperties;
use tracing::debug;

pub(crate) fn to_amqp(properties: &MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default();

    if let Some(content_type) = &properties.content_type {
        amqp = amqp.with_content_type(short(content_type));
    }
    if let Some(encoding) = &properties.content_encoding {
        amqp = amqp.with_content_encoding(short(encoding));
    }
    if let Some(mode) = properties.delivery_mode {
        amqp = amqp.with_delivery_mode(mode);
    }
    if let Some(expiration) = &properties.expiration {
        amqp = amqp.with_expiration(short(expiration));
    }
    if let Some(timestamp) = properties.timestamp {
        amqp = amqp.with_timestamp(timestamp);
    }
    if let Some(correlation_id) = &properties.correlation_id {
        amqp = amqp.with_correlation_id(short(correlation_id));
    }
    if let Some(reply_to) = &properties.reply_to {
        amqp = amqp.with_reply_to(short(reply_to));
    }
    if let Some(message_id) = &properties.message_id {
        amqp = amqp.with_message_id(short(message_id));
    }
    if !properties.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &properties.headers {
            table.insert(short(key), AMQPValue::LongString(LongString::from(value.clone())));
        }
        amqp = amqp.with_headers(table);
    }
    amqp
}

pub(crate) fn from_amqp(amqp: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());

    let headers = amqp
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    header_text(value).map(|text| (key.as_str().to_string(), text))
                })
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        content_type: text(amqp.content_type()),
        content_encoding: text(amqp.content_encoding()),
        delivery_mode: *amqp.delivery_mode(),
        expiration: text(amqp.expiration()),
        timestamp: *amqp.timestamp(),
        correlation_id: text(amqp.correlation_id()),
        reply_to: text(amqp.reply_to()),
        message_id: text(amqp.message_id()),
        headers,
    }
}

fn short(value: &str) -> ShortString {
    ShortString::from(value.to_string())
}

/// Only textual and integral header values are surfaced.
fn header_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::Boolean(b) => Some(b.to_string()),
        AMQPValue::ShortInt(n) => Some(n.to_string()),
        AMQPValue::LongInt(n) => Some(n.to_string()),
        AMQPValue::LongLongInt(n) => Some(n.to_string()),
        AMQPValue::LongUInt(n) => Some(n.to_string()),
        other => {
            debug!(value = ?other, "skipping non-textual header");
            None
        }
    }
}
