// src/rabbitmq/lapin_client.rs
//
// Production codec backed by lapin.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::uri::{AMQPScheme, AMQPUri};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::amqp_client::{
    AmqpChannel, AmqpConnector, AmqpTransport, ConnectionInfo, DeliveryStream, Headers,
    MessageProperties, RawDelivery,
};
use super::errors::{RabbitMQError, Result};
use super::schema::{Arguments, ExchangeConfig, ExchangeType, QueueDescriptor};

const STATUS_POLL: Duration = Duration::from_secs(1);

#[derive(Clone, Default)]
pub struct LapinConnector {
    properties: ConnectionProperties,
}

impl LapinConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

fn amqp_uri(info: &ConnectionInfo) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.scheme = if info.use_tls {
        AMQPScheme::AMQPS
    } else {
        AMQPScheme::AMQP
    };
    uri.authority.host = info.host.clone();
    uri.authority.port = info.port;
    uri.authority.userinfo.username = info.user.clone();
    uri.authority.userinfo.password = info.password.clone();
    uri.vhost = info.vhost.clone();
    uri.query.heartbeat = Some(info.heartbeat_seconds);
    uri
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self, info: &ConnectionInfo) -> Result<Arc<dyn AmqpTransport>> {
        match Connection::connect_uri(amqp_uri(info), self.properties.clone()).await {
            Ok(connection) => {
                info!("Connected to {}:{}{}", info.host, info.port, info.vhost);
                Ok(Arc::new(LapinTransport::open(connection)))
            }
            // lapin runs the login inside its handshake.
            Err(e) => match RabbitMQError::from(e) {
                RabbitMQError::AuthenticationError(reason) => {
                    Ok(Arc::new(LapinTransport::refused(reason)))
                }
                other => Err(other),
            },
        }
    }
}

pub struct LapinTransport {
    connection: Option<Connection>,
    refusal: Option<String>,
    failure: watch::Sender<Option<String>>,
}

impl LapinTransport {
    fn open(connection: Connection) -> Self {
        let (failure, _) = watch::channel(None);
        let reporter = failure.clone();
        connection.on_error(move |e| {
            warn!("Connection error: {}", e);
            reporter.send_replace(Some(e.to_string()));
        });

        Self {
            connection: Some(connection),
            refusal: None,
            failure,
        }
    }

    fn refused(reason: String) -> Self {
        let (failure, _) = watch::channel(Some(reason.clone()));
        Self {
            connection: None,
            refusal: Some(reason),
            failure,
        }
    }

    fn connection(&self) -> Result<&Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| RabbitMQError::ConnectionError("connection was refused".to_string()))
    }
}

#[async_trait]
impl AmqpTransport for LapinTransport {
    async fn authenticate(&self, user: &str, _password: &str) -> Result<()> {
        match &self.refusal {
            Some(reason) => Err(RabbitMQError::AuthenticationError(format!(
                "login refused for '{}': {}",
                user, reason
            ))),
            None => Ok(()),
        }
    }

    async fn open_channel(&self, number: u16) -> Result<Arc<dyn AmqpChannel>> {
        let inner = self.connection()?.create_channel().await?;
        debug!(number, wire_id = inner.id(), "Channel created");
        Ok(Arc::new(LapinChannel { number, inner }))
    }

    async fn closed(&self) -> String {
        let mut failure = self.failure.subscribe();
        let mut poll = tokio::time::interval(STATUS_POLL);
        loop {
            if let Some(reason) = failure.borrow_and_update().clone() {
                return reason;
            }
            match &self.connection {
                Some(connection) if connection.status().connected() => {}
                _ => return "connection closed".to_string(),
            }
            tokio::select! {
                changed = failure.changed() => {
                    if changed.is_err() {
                        return "connection dropped".to_string();
                    }
                }
                _ = poll.tick() => {}
            }
        }
    }

    async fn close(&self, reason: &str) -> Result<()> {
        match &self.connection {
            Some(connection) if connection.status().connected() => {
                connection.close(200, reason).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

pub struct LapinChannel {
    number: u16,
    inner: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn number(&self) -> u16 {
        self.number
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn queue_declare(&self, queue: &QueueDescriptor) -> Result<()> {
        let options = QueueDeclareOptions {
            durable: queue.durable,
            exclusive: queue.exclusive,
            auto_delete: queue.auto_delete,
            ..QueueDeclareOptions::default()
        };
        let declared = self
            .inner
            .queue_declare(&queue.name, options, field_table(&queue.arguments))
            .await?;
        debug!(queue = %queue.name, messages = declared.message_count(), "Queue declared");
        Ok(())
    }

    async fn exchange_declare(&self, exchange: &ExchangeConfig) -> Result<()> {
        let kind = match exchange.exchange_type {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Headers => ExchangeKind::Headers,
        };
        let options = ExchangeDeclareOptions {
            durable: exchange.durable,
            auto_delete: exchange.auto_delete,
            ..ExchangeDeclareOptions::default()
        };
        self.inner
            .exchange_declare(&exchange.name, kind, options, field_table(&exchange.arguments))
            .await
            .map_err(|e| match RabbitMQError::from(e) {
                RabbitMQError::DeclarationConflict(msg) => RabbitMQError::DeclarationError(format!(
                    "exchange '{}' exists with other settings: {}",
                    exchange.name, msg
                )),
                other => other,
            })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                field_table(arguments),
            )
            .await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        exclusive: bool,
    ) -> Result<Box<dyn DeliveryStream>> {
        let options = BasicConsumeOptions {
            exclusive,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .inner
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await
            .map_err(|e| RabbitMQError::ConsumeError(format!("basic.consume on '{}': {}", queue, e)))?;
        Ok(Box::new(LapinDeliveryStream { consumer }))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
        mandatory: bool,
    ) -> Result<()> {
        let options = BasicPublishOptions {
            mandatory,
            ..BasicPublishOptions::default()
        };
        // The confirm is not awaited: success means hand-off to the transport.
        self.inner
            .basic_publish(exchange, routing_key, options, body, basic_properties(properties))
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await?;
        Ok(())
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.inner.status().connected() {
            self.inner.close(200, "channel replaced").await?;
        }
        Ok(())
    }
}

struct LapinDeliveryStream {
    consumer: Consumer,
}

#[async_trait]
impl DeliveryStream for LapinDeliveryStream {
    async fn next_delivery(&mut self) -> Result<Option<RawDelivery>> {
        let delivery = match self.consumer.next().await {
            Some(delivery) => delivery.map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?,
            None => return Ok(None),
        };

        Ok(Some(RawDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            redelivered: delivery.redelivered,
            properties: message_properties(&delivery.properties),
            body: delivery.data,
        }))
    }
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(encoding) = &properties.content_encoding {
        basic = basic.with_content_encoding(ShortString::from(encoding.clone()));
    }
    if let Some(mode) = properties.delivery_mode {
        basic = basic.with_delivery_mode(mode);
    }
    if let Some(id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    if !properties.headers.is_empty() {
        basic = basic.with_headers(field_table(&properties.headers));
    }
    basic
}

fn message_properties(basic: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: basic.content_type().as_ref().map(|s| s.as_str().to_string()),
        content_encoding: basic.content_encoding().as_ref().map(|s| s.as_str().to_string()),
        delivery_mode: *basic.delivery_mode(),
        message_id: basic.message_id().as_ref().map(|s| s.as_str().to_string()),
        timestamp: *basic.timestamp(),
        headers: basic
            .headers()
            .as_ref()
            .map(headers_from_table)
            .unwrap_or_default(),
    }
}

fn field_table(values: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in values {
        table.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    table
}

fn headers_from_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), json_value(value)))
        .collect()
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => AMQPValue::LongLongInt(i),
            (None, Some(f)) => AMQPValue::Double(f),
            (None, None) => AMQPValue::Void,
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(amqp_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(ShortString::from(key.clone()), amqp_value(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

fn json_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => json!(i),
        AMQPValue::ShortShortUInt(u) => json!(u),
        AMQPValue::ShortInt(i) => json!(i),
        AMQPValue::ShortUInt(u) => json!(u),
        AMQPValue::LongInt(i) => json!(i),
        AMQPValue::LongUInt(u) => json!(u),
        AMQPValue::LongLongInt(i) => json!(i),
        AMQPValue::Float(f) => json!(f),
        AMQPValue::Double(d) => json!(d),
        AMQPValue::Timestamp(t) => json!(t),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(items) => Value::Array(items.as_slice().iter().map(json_value).collect()),
        AMQPValue::FieldTable(table) => Value::Object(
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_string(), json_value(value)))
                .collect::<Map<String, Value>>(),
        ),
        AMQPValue::Void => Value::Null,
        other => Value::String(format!("{:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_follows_connection_info() {
        let info = ConnectionInfo::new("mq.internal", 5671)
            .with_credentials("svc", "pw")
            .with_vhost("/events");
        let uri = amqp_uri(&ConnectionInfo { use_tls: true, ..info });

        assert_eq!(uri.scheme, AMQPScheme::AMQPS);
        assert_eq!(uri.authority.host, "mq.internal");
        assert_eq!(uri.authority.port, 5671);
        assert_eq!(uri.authority.userinfo.username, "svc");
        assert_eq!(uri.vhost, "/events");
        assert_eq!(uri.query.heartbeat, Some(30));
    }

    #[test]
    fn headers_survive_field_table_conversion() {
        let mut headers = Headers::new();
        headers.insert("x-message-type".into(), json!("monitoring.DeviceEvent"));
        headers.insert("x-retries".into(), json!(3));
        headers.insert("x-tags".into(), json!(["a", "b"]));
        headers.insert("x-nested".into(), json!({ "ok": true }));

        assert_eq!(headers_from_table(&field_table(&headers)), headers);
    }

    #[test]
    fn properties_map_both_ways() {
        let properties = MessageProperties {
            content_type: Some("application/json".into()),
            content_encoding: Some("deflate".into()),
            delivery_mode: Some(2),
            message_id: Some("id-1".into()),
            timestamp: Some(1_700_000_000),
            headers: Headers::new(),
        };
        assert_eq!(message_properties(&basic_properties(&properties)), properties);
    }
}
