// src/rabbitmq/amqp_client.rs
//
// The protocol library a session drives. Everything on this seam is
// protocol plumbing; the session state machine lives in `session.rs`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::Result;
use super::schema::{Arguments, ExchangeConfig, QueueDescriptor};

/// Message headers as exchanged with the broker.
pub type Headers = BTreeMap<String, Value>;

/// Where and how to reach the broker. Fixed for the lifetime of a manager.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_user")]
    pub password: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u16,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(u64::from(self.heartbeat_seconds))
    }
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            vhost: default_vhost(),
            user: default_user(),
            password: default_user(),
            use_tls: false,
            heartbeat_seconds: default_heartbeat(),
        }
    }
}

// Never print the password.
impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("use_tls", &self.use_tls)
            .field("heartbeat_seconds", &self.heartbeat_seconds)
            .finish()
    }
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    5672
}
fn default_vhost() -> String {
    "/".to_string()
}
fn default_user() -> String {
    "guest".to_string()
}
fn default_heartbeat() -> u16 {
    30
}

/// Basic properties this layer reads and writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub delivery_mode: Option<u8>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub headers: Headers,
}

/// A delivery exactly as the broker handed it over.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Opens transports to a broker.
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    /// Establishes the transport. Failing here is a transport fault.
    async fn connect(&self, info: &ConnectionInfo) -> Result<Arc<dyn AmqpTransport>>;
}

/// One physical connection.
#[async_trait]
pub trait AmqpTransport: Send + Sync {
    async fn authenticate(&self, user: &str, password: &str) -> Result<()>;

    async fn open_channel(&self, number: u16) -> Result<Arc<dyn AmqpChannel>>;

    /// Resolves with a reason once the connection is gone (socket reset,
    /// missed heartbeats, broker close).
    async fn closed(&self) -> String;

    async fn close(&self, reason: &str) -> Result<()>;
}

/// One logical channel on a transport.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn number(&self) -> u16;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;

    async fn queue_declare(&self, queue: &QueueDescriptor) -> Result<()>;

    async fn exchange_declare(&self, exchange: &ExchangeConfig) -> Result<()>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<()>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        exclusive: bool,
    ) -> Result<Box<dyn DeliveryStream>>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
        mandatory: bool,
    ) -> Result<()>;

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Deliveries for one consumer, in broker order.
#[async_trait]
pub trait DeliveryStream: Send {
    /// `Ok(None)` is the queue-closed signal.
    async fn next_delivery(&mut self) -> Result<Option<RawDelivery>>;
}
