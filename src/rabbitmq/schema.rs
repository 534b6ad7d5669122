//! Queue and exchange schema: resolves logical identifiers into the concrete
//! parameters used when declaring them on a channel.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{RabbitMQError, Result};

/// Declaration arguments (`x-message-ttl`, `x-max-length`, ...).
pub type Arguments = BTreeMap<String, Value>;

/// Values substituted for `{key}` placeholders in queue names and routing keys.
pub type Replacements = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    NonPersistent,
    #[default]
    Persistent,
}

impl DeliveryMode {
    /// Value of the AMQP `delivery-mode` property.
    pub fn as_u8(self) -> u8 {
        match self {
            DeliveryMode::NonPersistent => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Deflate,
}

/// Everything needed to declare an exchange and publish to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    #[serde(default, rename = "type")]
    pub exchange_type: ExchangeType,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub arguments: Arguments,
}

impl ExchangeConfig {
    pub fn new(name: impl Into<String>, exchange_type: ExchangeType) -> Self {
        Self {
            name: name.into(),
            exchange_type,
            durable: true,
            auto_delete: false,
            delivery_mode: DeliveryMode::Persistent,
            compression: Compression::None,
            arguments: Arguments::new(),
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_delivery_mode(mut self, delivery_mode: DeliveryMode) -> Self {
        self.delivery_mode = delivery_mode;
        self
    }
}

/// A resolved binding of a queue to an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingDescriptor {
    pub exchange: ExchangeConfig,
    pub routing_key: String,
    pub arguments: Arguments,
}

/// A fully resolved queue, ready to be declared.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDescriptor {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Arguments,
    pub bindings: Vec<BindingDescriptor>,
}

impl QueueDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: Arguments::new(),
            bindings: Vec::new(),
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    pub fn bound_to(mut self, exchange: ExchangeConfig, routing_key: impl Into<String>) -> Self {
        self.bindings.push(BindingDescriptor {
            exchange,
            routing_key: routing_key.into(),
            arguments: Arguments::new(),
        });
        self
    }
}

/// Resolves logical queue/exchange identifiers.
pub trait SchemaAdapter: Send + Sync {
    fn resolve_queue(&self, identifier: &str, replacements: &Replacements)
        -> Result<QueueDescriptor>;

    fn resolve_exchange(&self, identifier: &str) -> Result<ExchangeConfig>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    pub exchange: String,
    pub routing_key: String,
    #[serde(default)]
    pub arguments: Arguments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub arguments: Arguments,
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
}

/// Schema loaded from configuration; identifiers map to exchange/queue entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSchema {
    #[serde(default)]
    pub exchanges: HashMap<String, ExchangeConfig>,
    #[serde(default)]
    pub queues: HashMap<String, QueueConfig>,
}

impl QueueSchema {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| RabbitMQError::SchemaError(format!("invalid schema document: {}", e)))
    }

    pub fn with_exchange(mut self, identifier: impl Into<String>, exchange: ExchangeConfig) -> Self {
        self.exchanges.insert(identifier.into(), exchange);
        self
    }

    pub fn with_queue(mut self, identifier: impl Into<String>, queue: QueueConfig) -> Self {
        self.queues.insert(identifier.into(), queue);
        self
    }
}

impl SchemaAdapter for QueueSchema {
    fn resolve_queue(
        &self,
        identifier: &str,
        replacements: &Replacements,
    ) -> Result<QueueDescriptor> {
        let queue = self
            .queues
            .get(identifier)
            .ok_or_else(|| RabbitMQError::SchemaError(format!("unknown queue '{}'", identifier)))?;

        let bindings = queue
            .bindings
            .iter()
            .map(|binding| {
                Ok(BindingDescriptor {
                    exchange: self.resolve_exchange(&binding.exchange)?,
                    routing_key: substitute(&binding.routing_key, replacements)?,
                    arguments: binding.arguments.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(QueueDescriptor {
            name: substitute(&queue.name, replacements)?,
            durable: queue.durable,
            exclusive: queue.exclusive,
            auto_delete: queue.auto_delete,
            arguments: queue.arguments.clone(),
            bindings,
        })
    }

    fn resolve_exchange(&self, identifier: &str) -> Result<ExchangeConfig> {
        self.exchanges.get(identifier).cloned().ok_or_else(|| {
            RabbitMQError::SchemaError(format!("unknown exchange '{}'", identifier))
        })
    }
}

/// Fills `{key}` placeholders; an unmatched placeholder is an error.
fn substitute(template: &str, replacements: &Replacements) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            RabbitMQError::SchemaError(format!("unterminated placeholder in '{}'", template))
        })?;
        let key = &after[..end];
        let value = replacements.get(key).ok_or_else(|| {
            RabbitMQError::SchemaError(format!("missing replacement '{}' for '{}'", key, template))
        })?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}

fn default_true() -> bool {
    true
}
