// src/rabbitmq/message.rs
//
// Payload codec: serialization, type metadata and optional compression on the
// way out, the reverse on the way in.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use super::amqp_client::{Headers, MessageProperties, RawDelivery};
use super::errors::{RabbitMQError, Result};
use super::schema::{Compression, ExchangeConfig};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";
pub const MESSAGE_TYPE_HEADER: &str = "x-message-type";
pub const DEFLATE_ENCODING: &str = "deflate";

/// A structured message type carried as JSON.
pub trait TypedMessage: Serialize + DeserializeOwned {
    /// Fully qualified name written to the type header.
    fn type_name() -> &'static str;
}

/// What a caller hands to `send`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Raw(Vec<u8>),
    Structured { type_name: String, body: Vec<u8> },
}

impl Payload {
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Payload::Raw(bytes.into())
    }

    pub fn message<M: TypedMessage>(message: &M) -> Result<Self> {
        Ok(Payload::Structured {
            type_name: M::type_name().to_string(),
            body: serde_json::to_vec(message)?,
        })
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Raw(bytes)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Raw(text.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Raw(text.into_bytes())
    }
}

/// Body and properties ready for `basic_publish`.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Applies the exchange's delivery mode and compression to `payload`.
pub fn encode(payload: Payload, mut headers: Headers, exchange: &ExchangeConfig) -> Result<EncodedMessage> {
    let (content_type, body) = match payload {
        Payload::Raw(body) => (CONTENT_TYPE_BINARY, body),
        Payload::Structured { type_name, body } => {
            headers.insert(MESSAGE_TYPE_HEADER.to_string(), Value::String(type_name));
            (CONTENT_TYPE_JSON, body)
        }
    };

    let (body, content_encoding) = match exchange.compression {
        Compression::None => (body, None),
        Compression::Deflate => (compress(&body)?, Some(DEFLATE_ENCODING.to_string())),
    };

    Ok(EncodedMessage {
        body,
        properties: MessageProperties {
            content_type: Some(content_type.to_string()),
            content_encoding,
            delivery_mode: Some(exchange.delivery_mode.as_u8()),
            message_id: Some(Uuid::new_v4().to_string()),
            timestamp: Some(chrono::Utc::now().timestamp() as u64),
            headers,
        },
    })
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|e| RabbitMQError::CompressionError(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| RabbitMQError::CompressionError(e.to_string()))
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| RabbitMQError::CompressionError(e.to_string()))?;
    Ok(out)
}

/// A delivery handed to a message handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    /// Session channel the delivery arrived on; tags are only valid there.
    pub channel_number: u16,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    /// Set when the body could not be decoded and is passed on as received.
    pub decode_error: Option<String>,
}

impl Delivery {
    /// Inflates a compressed body. A body that fails to inflate is kept as-is
    /// so the message still reaches the handler.
    pub fn from_raw(raw: RawDelivery, queue: &str, channel_number: u16) -> Self {
        let mut decode_error = None;
        let body = match raw.properties.content_encoding.as_deref() {
            None | Some("") | Some("identity") => raw.body,
            Some(DEFLATE_ENCODING) => match decompress(&raw.body) {
                Ok(body) => body,
                Err(e) => {
                    warn!(queue, delivery_tag = raw.delivery_tag, "Failed to decompress delivery: {}", e);
                    decode_error = Some(e.to_string());
                    raw.body
                }
            },
            Some(other) => {
                warn!(queue, delivery_tag = raw.delivery_tag, "Unsupported content encoding '{}'", other);
                decode_error = Some(format!("unsupported content encoding '{}'", other));
                raw.body
            }
        };

        Delivery {
            delivery_tag: raw.delivery_tag,
            channel_number,
            queue: queue.to_string(),
            exchange: raw.exchange,
            routing_key: raw.routing_key,
            redelivered: raw.redelivered,
            properties: raw.properties,
            body,
            decode_error,
        }
    }

    pub fn type_name(&self) -> Option<&str> {
        self.properties
            .headers
            .get(MESSAGE_TYPE_HEADER)
            .and_then(Value::as_str)
    }

    /// Deserializes a structured message, checking the type header first.
    pub fn decode<M: TypedMessage>(&self) -> Result<M> {
        if let Some(error) = &self.decode_error {
            return Err(RabbitMQError::DeserializationError(error.clone()));
        }
        match self.type_name() {
            Some(name) if name == M::type_name() => {}
            other => {
                return Err(RabbitMQError::DeserializationError(format!(
                    "expected message type '{}', got {:?}",
                    M::type_name(),
                    other
                )))
            }
        }
        serde_json::from_slice(&self.body)
            .map_err(|e| RabbitMQError::DeserializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::schema::{DeliveryMode, ExchangeType};
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct DeviceEvent {
        device: String,
        severity: u8,
    }

    impl TypedMessage for DeviceEvent {
        fn type_name() -> &'static str {
            "monitoring.DeviceEvent"
        }
    }

    fn raw_delivery(encoded: EncodedMessage) -> RawDelivery {
        RawDelivery {
            delivery_tag: 1,
            exchange: "events".into(),
            routing_key: "event.router".into(),
            redelivered: false,
            properties: encoded.properties,
            body: encoded.body,
        }
    }

    #[test]
    fn raw_payload_uses_binary_content_type() {
        let exchange = ExchangeConfig::new("events", ExchangeType::Topic);
        let encoded = encode(Payload::from("ping"), Headers::new(), &exchange).unwrap();

        assert_eq!(encoded.body, b"ping");
        assert_eq!(encoded.properties.content_type.as_deref(), Some(CONTENT_TYPE_BINARY));
        assert_eq!(encoded.properties.content_encoding, None);
        assert_eq!(encoded.properties.delivery_mode, Some(2));
        assert!(!encoded.properties.headers.contains_key(MESSAGE_TYPE_HEADER));
        assert!(encoded.properties.message_id.is_some());
    }

    #[test]
    fn structured_payload_carries_type_header() {
        let exchange = ExchangeConfig::new("events", ExchangeType::Topic)
            .with_delivery_mode(DeliveryMode::NonPersistent);
        let event = DeviceEvent { device: "router".into(), severity: 4 };
        let encoded = encode(Payload::message(&event).unwrap(), Headers::new(), &exchange).unwrap();

        assert_eq!(encoded.properties.content_type.as_deref(), Some(CONTENT_TYPE_JSON));
        assert_eq!(encoded.properties.delivery_mode, Some(1));

        let delivery = Delivery::from_raw(raw_delivery(encoded), "events.router", 1);
        assert_eq!(delivery.type_name(), Some("monitoring.DeviceEvent"));
        assert_eq!(delivery.decode::<DeviceEvent>().unwrap(), event);
    }

    #[test]
    fn compression_round_trips_byte_identical() {
        let exchange = ExchangeConfig::new("events", ExchangeType::Topic)
            .with_compression(Compression::Deflate);
        let body: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let encoded = encode(Payload::raw(body.clone()), Headers::new(), &exchange).unwrap();

        assert_eq!(encoded.properties.content_encoding.as_deref(), Some(DEFLATE_ENCODING));
        assert_ne!(encoded.body, body);

        let delivery = Delivery::from_raw(raw_delivery(encoded), "q", 1);
        assert_eq!(delivery.body, body);
        assert!(delivery.decode_error.is_none());
    }

    #[test]
    fn corrupt_compressed_body_is_passed_through() {
        let mut properties = MessageProperties::default();
        properties.content_encoding = Some(DEFLATE_ENCODING.into());
        let raw = RawDelivery {
            delivery_tag: 9,
            exchange: String::new(),
            routing_key: "q".into(),
            redelivered: false,
            properties,
            body: b"definitely not zlib".to_vec(),
        };

        let delivery = Delivery::from_raw(raw, "q", 3);
        assert_eq!(delivery.body, b"definitely not zlib");
        assert!(delivery.decode_error.is_some());
        assert_eq!(delivery.channel_number, 3);
    }

    #[test]
    fn decode_rejects_wrong_type() {
        let exchange = ExchangeConfig::new("events", ExchangeType::Topic);
        let encoded = encode(Payload::from("{}"), Headers::new(), &exchange).unwrap();
        let delivery = Delivery::from_raw(raw_delivery(encoded), "q", 1);

        assert!(matches!(
            delivery.decode::<DeviceEvent>(),
            Err(RabbitMQError::DeserializationError(_))
        ));
    }
}
