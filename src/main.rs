use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use rabbit_session::config::{self, SessionConfig, CONFIG_FILE_NAME};
use rabbit_session::env::apply_env;
use rabbit_session::rabbitmq::{ConnectionManager, Delivery, ShutdownOutcome};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match config::load_config() {
        Ok(config) => config,
        Err(e) => {
            warn!("{}; writing defaults to {}", e, CONFIG_FILE_NAME);
            config::create_default_config_file(Path::new(CONFIG_FILE_NAME))?;
            SessionConfig::default()
        }
    };

    let info = apply_env(config.connection)?;
    info!("Using broker {:?}", info);

    let manager = Arc::new(ConnectionManager::connect(info, config.schema, config.session));

    for queue_id in &config.listen {
        let acker = manager.clone();
        let handler = move |delivery: Delivery| {
            let acker = acker.clone();
            async move {
                log_delivery(&delivery);
                if let Err(e) = acker.acknowledge(&delivery, false).await {
                    warn!(queue = %delivery.queue, "Failed to acknowledge: {}", e);
                }
            }
        };
        manager.listen(queue_id, handler, false).await?;
        info!("Registered listener for {}", queue_id);
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");

    match manager.shutdown().await {
        ShutdownOutcome::ConnectionShut => info!("Connection closed"),
        ShutdownOutcome::NotConnected => info!("Was not connected"),
    }
    Ok(())
}

fn log_delivery(delivery: &Delivery) {
    match &delivery.decode_error {
        Some(e) => error!(queue = %delivery.queue, "Undecodable delivery: {}", e),
        None => info!(
            queue = %delivery.queue,
            routing_key = %delivery.routing_key,
            message_type = delivery.type_name().unwrap_or("raw"),
            bytes = delivery.body.len(),
            "Received message"
        ),
    }
}
