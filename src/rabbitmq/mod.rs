// src/rabbitmq/mod.rs
// Resilient session layer over an AMQP 0-9-1 codec

pub mod errors;
pub mod amqp_client;
pub mod lapin_client;
pub mod schema;
pub mod message;
pub mod event_hook;
pub mod backoff;
pub mod channel_manager;
pub mod consumer;
pub mod publisher;
pub mod session;
pub mod connection;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{
    AmqpChannel, AmqpConnector, AmqpTransport, ConnectionInfo, DeliveryStream, Headers,
    MessageProperties, RawDelivery,
};
pub use backoff::{ReconnectPolicy, ReconnectSettings};
pub use connection::{ConnectionManager, SessionSettings, ShutdownOutcome};
pub use consumer::MessageHandler;
pub use errors::{RabbitMQError, Result};
pub use event_hook::{AuthOutcome, EventHook, SessionHooks, SessionReady};
pub use lapin_client::LapinConnector;
pub use message::{Delivery, Payload, TypedMessage};
pub use publisher::{Confirmation, SendOptions, SendReport};
pub use schema::{
    Compression, DeliveryMode, ExchangeConfig, ExchangeType, QueueDescriptor, QueueSchema,
    Replacements, SchemaAdapter,
};
pub use session::{QueueBinding, Session, SessionState};
