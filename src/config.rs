use std::time::Duration;

use serde::Deserialize;

/// Runtime configuration, loaded from `AXONQ_`-prefixed environment
/// variables. Every field has a default so an empty environment yields a
/// working in-process configuration.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Path to the backing SQLite database. `None` uses an in-memory store.
    pub db_path: Option<String>,

    /// Upper bound on a message body, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Upper bound on the number of attributes per message.
    #[serde(default = "default_max_attributes")]
    pub max_attributes: usize,

    /// Longest wait a receive call may request, in milliseconds.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Longest visibility timeout a lease may carry, in milliseconds.
    #[serde(default = "default_max_visibility_ms")]
    pub max_visibility_ms: u64,

    /// Longest enqueue delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Concurrent long-poll waiters allowed per queue before shedding.
    #[serde(default = "default_max_waiters")]
    pub max_waiters_per_queue: usize,

    /// Cadence of the per-queue maintenance tick (retention and dedup
    /// purging, lease re-seeding), in milliseconds.
    #[serde(default = "default_maintenance_ms")]
    pub maintenance_interval_ms: u64,
}

fn default_max_message_size() -> usize {
    262_144
}

fn default_max_attributes() -> usize {
    10
}

fn default_max_wait_ms() -> u64 {
    20_000
}

fn default_max_visibility_ms() -> u64 {
    43_200_000
}

fn default_max_delay_ms() -> u64 {
    900_000
}

fn default_max_waiters() -> usize {
    128
}

fn default_maintenance_ms() -> u64 {
    60_000
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("AXONQ_").from_env::<Self>()?)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        // A zero interval would make the tick loop spin.
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            max_message_size: default_max_message_size(),
            max_attributes: default_max_attributes(),
            max_wait_ms: default_max_wait_ms(),
            max_visibility_ms: default_max_visibility_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_waiters_per_queue: default_max_waiters(),
            maintenance_interval_ms: default_maintenance_ms(),
        }
    }
}
