use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::amqp_client::{AmqpChannel, AmqpTransport};
use super::errors::{RabbitMQError, Result};

/// Configuration options for a session's channels
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub prefetch_count: u16,

    /// Channel identifier for logging
    pub id: String,
}

struct ChannelSlot {
    channel: Arc<dyn AmqpChannel>,
    qos_applied: bool,
}

/// Owns the logical channel of one physical connection.
///
/// Channel numbers start at 1 and only ever grow; a number is never handed
/// out twice on the same transport.
pub struct ChannelManager {
    transport: Arc<dyn AmqpTransport>,
    config: ChannelConfig,
    next_number: AtomicU16,
    current: Mutex<Option<ChannelSlot>>,
}

impl ChannelManager {
    pub fn new(transport: Arc<dyn AmqpTransport>, config: ChannelConfig) -> Self {
        debug!(
            channel_id = %config.id,
            prefetch = %config.prefetch_count,
            "Creating channel manager"
        );

        Self {
            transport,
            config,
            next_number: AtomicU16::new(1),
            current: Mutex::new(None),
        }
    }

    /// Opens a fresh channel, makes it current and applies QoS to it.
    pub async fn open(&self) -> Result<Arc<dyn AmqpChannel>> {
        // 0 marks the counter as exhausted; handing out u16::MAX wraps onto it.
        let number = self
            .next_number
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                (next != 0).then(|| next.wrapping_add(1))
            })
            .map_err(|_| {
                RabbitMQError::ChannelError("channel numbers exhausted on this connection".to_string())
            })?;

        debug!(channel_id = %self.config.id, number, "Opening channel");
        let channel = self.transport.open_channel(number).await?;
        *self.lock() = Some(ChannelSlot {
            channel: channel.clone(),
            qos_applied: false,
        });
        self.ensure_qos().await?;

        info!("Channel {} #{} opened", self.config.id, number);
        Ok(channel)
    }

    /// Applies the prefetch limit to the current channel unless that channel
    /// already has it.
    pub async fn ensure_qos(&self) -> Result<()> {
        if self.config.prefetch_count == 0 {
            return Ok(());
        }

        let channel = match &*self.lock() {
            Some(slot) if !slot.qos_applied => slot.channel.clone(),
            _ => return Ok(()),
        };

        debug!("Setting channel QoS to {}", self.config.prefetch_count);
        channel
            .basic_qos(self.config.prefetch_count)
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))?;

        if let Some(slot) = self.lock().as_mut() {
            if slot.channel.number() == channel.number() {
                slot.qos_applied = true;
            }
        }
        Ok(())
    }

    /// Discards the current channel and opens a new one in its place.
    pub async fn reopen(&self) -> Result<Arc<dyn AmqpChannel>> {
        let previous = self.lock().take();
        if let Some(slot) = previous {
            let number = slot.channel.number();
            // The broker has usually closed it already.
            if let Err(e) = slot.channel.close().await {
                debug!(number, "Discarded channel did not close cleanly: {}", e);
            }
        }
        self.open().await
    }

    pub fn get_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        self.lock()
            .as_ref()
            .map(|slot| slot.channel.clone())
            .ok_or_else(|| RabbitMQError::ChannelError("Channel is not available".to_string()))
    }

    pub fn current_number(&self) -> Option<u16> {
        self.lock().as_ref().map(|slot| slot.channel.number())
    }

    pub async fn close(&self) {
        let current = self.lock().take();
        if let Some(slot) = current {
            if let Err(e) = slot.channel.close().await {
                warn!(channel_id = %self.config.id, "Failed to close channel: {}", e);
            }
        }
    }

    pub fn prefetch_count(&self) -> u16 {
        self.config.prefetch_count
    }

    /// Return the channel ID for logging
    pub fn id(&self) -> &str {
        &self.config.id
    }

    fn lock(&self) -> MutexGuard<'_, Option<ChannelSlot>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
