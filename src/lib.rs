pub mod config;
pub mod env;
pub mod rabbitmq;

pub use rabbitmq::{ConnectionManager, RabbitMQError, Result};
