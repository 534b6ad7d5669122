// src/rabbitmq/errors.rs

use lapin::protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError};
use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ authentication refused: {0}")]
    AuthenticationError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Queue declaration conflict: {0}")]
    DeclarationConflict(String),

    #[error("Declaration error: {0}")]
    DeclarationError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("Compression error: {0}")]
    CompressionError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No ready session")]
    NotConnected,

    #[error("Session manager is shutting down")]
    ShuttingDown,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// True for the broker's PRECONDITION_FAILED reply to a queue declaration.
    pub fn is_declaration_conflict(&self) -> bool {
        matches!(self, RabbitMQError::DeclarationConflict(_))
    }
}

// Converting from lapin errors, classified by AMQP reply kind
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        let error_text = error.to_string();

        match &error {
            LapinError::IOError(_) | LapinError::InvalidConnectionState(_) => {
                RabbitMQError::ConnectionError(error_text)
            }
            LapinError::InvalidChannel(_)
            | LapinError::InvalidChannelState(_)
            | LapinError::ChannelsLimitReached => RabbitMQError::ChannelError(error_text),
            LapinError::ProtocolError(amqp_error) => match amqp_error.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                    RabbitMQError::DeclarationConflict(error_text)
                }
                AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)
                | AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED) => {
                    RabbitMQError::AuthenticationError(error_text)
                }
                AMQPErrorKind::Soft(_) => RabbitMQError::ChannelError(error_text),
                AMQPErrorKind::Hard(_) => RabbitMQError::ConnectionError(error_text),
            },
            _ => RabbitMQError::Unknown(error_text),
        }
    }
}

impl From<String> for RabbitMQError {
    fn from(message: String) -> Self {
        RabbitMQError::Unknown(message)
    }
}

impl From<&str> for RabbitMQError {
    fn from(message: &str) -> Self {
        RabbitMQError::Unknown(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_recognised() {
        let err = RabbitMQError::DeclarationConflict("inequivalent arg 'durable'".into());
        assert!(err.is_declaration_conflict());
        assert!(!RabbitMQError::DeclarationError("boom".into()).is_declaration_conflict());
    }

    #[test]
    fn strings_become_unknown() {
        let err: RabbitMQError = "something odd".into();
        assert_eq!(err.to_string(), "Unknown error: something odd");
    }
}
