// src/rabbitmq/backoff.rs

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for [`ReconnectPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Fraction of the delay added at random (0.15 = up to +15%). One-sided so
    /// successive delays keep growing until the cap.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_factor() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.15
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
            jitter: default_jitter(),
            max_attempts: None,
        }
    }
}

/// Bounded exponential backoff with jitter, reset whenever a transport is
/// established.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    settings: ReconnectSettings,
    attempts: u32,
    delay_ms: f64,
}

impl ReconnectPolicy {
    pub fn new(settings: ReconnectSettings) -> Self {
        let delay_ms = settings.initial_delay_ms as f64;
        Self {
            settings,
            attempts: 0,
            delay_ms,
        }
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.settings.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }
        self.attempts += 1;

        let base = self.delay_ms;
        let jitter = if self.settings.jitter > 0.0 {
            rand::random::<f64>() * self.settings.jitter * base
        } else {
            0.0
        };
        let cap = self.settings.max_delay_ms as f64;
        let sleep_ms = (base + jitter).min(cap);

        // Increase delay for next attempt (exponential backoff)
        self.delay_ms = (base * self.settings.factor).min(cap);

        Some(Duration::from_millis(sleep_ms as u64))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.delay_ms = self.settings.initial_delay_ms as f64;
    }
}
