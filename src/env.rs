// src/env.rs
//
// Environment overrides for the broker connection. `.env` is loaded first if
// present; any variable that is set wins over the configuration file.

use std::env;
use std::str::FromStr;

use dotenv::dotenv;

use crate::rabbitmq::{ConnectionInfo, RabbitMQError, Result};

pub const AMQP_HOST: &str = "AMQP_HOST";
pub const AMQP_PORT: &str = "AMQP_PORT";
pub const AMQP_VHOST: &str = "AMQP_VHOST";
pub const AMQP_USER: &str = "AMQP_USER";
pub const AMQP_PASSWORD: &str = "AMQP_PASSWORD";
pub const AMQP_USE_TLS: &str = "AMQP_USE_TLS";
pub const AMQP_HEARTBEAT: &str = "AMQP_HEARTBEAT";

/// Connection info from defaults plus the process environment.
pub fn connection_info_from_env() -> Result<ConnectionInfo> {
    apply_env(ConnectionInfo::default())
}

/// Overlays the process environment (and `.env`) onto `base`.
pub fn apply_env(base: ConnectionInfo) -> Result<ConnectionInfo> {
    dotenv().ok();
    apply_overrides(base, |key| env::var(key).ok())
}

/// Overlays whatever `lookup` returns onto `base`.
pub fn apply_overrides<F>(base: ConnectionInfo, lookup: F) -> Result<ConnectionInfo>
where
    F: Fn(&str) -> Option<String>,
{
    let mut info = base;

    if let Some(host) = lookup(AMQP_HOST) {
        info.host = host;
    }
    if let Some(port) = parsed(&lookup, AMQP_PORT)? {
        info.port = port;
    }
    if let Some(vhost) = lookup(AMQP_VHOST) {
        info.vhost = vhost;
    }
    if let Some(user) = lookup(AMQP_USER) {
        info.user = user;
    }
    if let Some(password) = lookup(AMQP_PASSWORD) {
        info.password = password;
    }
    if let Some(flag) = lookup(AMQP_USE_TLS) {
        info.use_tls = parse_flag(AMQP_USE_TLS, &flag)?;
    }
    if let Some(heartbeat) = parsed(&lookup, AMQP_HEARTBEAT)? {
        info.heartbeat_seconds = heartbeat;
    }

    Ok(info)
}

fn parsed<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| RabbitMQError::ConfigError(format!("{}='{}': {}", key, value, e))),
        None => Ok(None),
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(RabbitMQError::ConfigError(format!(
            "{}='{}' is not a boolean",
            key, other
        ))),
    }
}
