// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::rabbitmq::schema::{BindingConfig, QueueConfig};
use crate::rabbitmq::{
    ConnectionInfo, ExchangeConfig, ExchangeType, QueueSchema, SessionSettings,
};

pub const CONFIG_FILE_NAME: &str = "rabbit_session.json";

// Configuration structures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub connection: ConnectionInfo,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub schema: QueueSchema,
    /// Schema queue identifiers the binary listens to.
    #[serde(default)]
    pub listen: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let schema = QueueSchema::default()
            .with_exchange("$Events", ExchangeConfig::new("events", ExchangeType::Topic))
            .with_queue(
                "$AllEvents",
                QueueConfig {
                    name: "events.all".to_string(),
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    arguments: Default::default(),
                    bindings: vec![BindingConfig {
                        exchange: "$Events".to_string(),
                        routing_key: "#".to_string(),
                        arguments: Default::default(),
                    }],
                },
            );

        Self {
            connection: ConnectionInfo::default(),
            session: SessionSettings::default(),
            schema,
            listen: vec!["$AllEvents".to_string()],
        }
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Result<PathBuf> {
    let config_in_dir = Path::new("config").join(CONFIG_FILE_NAME);
    let locations = [
        ("Current directory", Path::new(CONFIG_FILE_NAME)),
        ("Current directory (alternative)", config_in_dir.as_path()),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    // Try the user's home directory
    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} in the current directory, config/, or your home directory",
        CONFIG_FILE_NAME
    ))
}

pub fn load_config() -> Result<SessionConfig> {
    let config_path = find_config_file()?;
    load_config_from(&config_path)
}

pub fn load_config_from(config_path: &Path) -> Result<SessionConfig> {
    let config_content = fs::read_to_string(config_path)
        .context(format!("Failed to read config file at {}", config_path.display()))?;

    let config: SessionConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or missing required fields")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &SessionConfig) -> Result<()> {
    if config.connection.host.is_empty() {
        return Err(anyhow!("Configuration error: connection.host cannot be empty"));
    }
    for queue_id in &config.listen {
        if !config.schema.queues.contains_key(queue_id) {
            return Err(anyhow!(
                "Configuration error: listen entry '{}' is not a queue in the schema",
                queue_id
            ));
        }
    }
    for (queue_id, queue) in &config.schema.queues {
        for binding in &queue.bindings {
            if !config.schema.exchanges.contains_key(&binding.exchange) {
                return Err(anyhow!(
                    "Configuration error: queue '{}' binds to unknown exchange '{}'",
                    queue_id,
                    binding.exchange
                ));
            }
        }
    }
    Ok(())
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&SessionConfig::default())
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .context(format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
