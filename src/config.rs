use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::relay::{room::Room, server::SessionSettings};

/// Name under which the configuration file is stored.
pub const APP_NAME: &str = "room-relay";
const CONFIG_NAME: &str = "config";

/// Represents the configuration settings for the relay.
///
/// Values come from the configuration file, then from the `APP_*`
/// environment variables, then from command line flags, each overriding the
/// one before.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// The environment in which the application is running.
    ///
    /// Possible values are "production" or "development".
    pub app_environment: String,

    /// The address the relay listens on.
    pub app_host: String,

    /// The port the relay listens on.
    pub app_port: u16,

    /// Maximum number of members per room.
    pub room_capacity: usize,

    /// Frames queued for one client before it is dropped as too slow.
    pub outbound_buffer: usize,

    /// Seconds a client may stay silent before its session is closed.
    /// `0` disables the deadline.
    pub idle_timeout_secs: u64,

    /// The logging filter used when `RUST_LOG` is not set.
    pub rust_log: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            app_environment: "production".to_string(),
            app_host: "0.0.0.0".to_string(),
            app_port: 8000,
            room_capacity: Room::DEFAULT_CAPACITY,
            outbound_buffer: 64,
            idle_timeout_secs: 0,
            rust_log: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Loads the configuration file, creating it with defaults if missing.
    pub fn load() -> Result<RelayConfig, confy::ConfyError> {
        confy::load(APP_NAME, CONFIG_NAME)
    }

    pub fn path() -> Result<PathBuf, confy::ConfyError> {
        confy::get_configuration_file_path(APP_NAME, CONFIG_NAME)
    }

    /// Applies `APP_ENVIRONMENT`, `APP_HOST` and `APP_PORT` from the process
    /// environment.
    pub fn with_env_overrides(self) -> RelayConfig {
        self.apply_env(|key| std::env::var(key).ok())
    }

    fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> RelayConfig {
        if let Some(environment) = lookup("APP_ENVIRONMENT") {
            self.app_environment = environment;
        }
        if let Some(host) = lookup("APP_HOST") {
            self.app_host = host;
        }
        if let Some(port) = lookup("APP_PORT").and_then(|port| port.parse().ok()) {
            self.app_port = port;
        }
        self
    }

    /// Checks the values that have no sensible fallback.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (1..=Room::DEFAULT_CAPACITY).contains(&self.room_capacity),
            "room_capacity must be between 1 and {}, got {}",
            Room::DEFAULT_CAPACITY,
            self.room_capacity
        );
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            outbound_buffer: self.outbound_buffer,
            idle_timeout: self.idle_timeout(),
        }
    }
}
