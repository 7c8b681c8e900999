// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Engine configuration.
//!
//! Loaded from a TOML file. Only `url` and `queue_path` are required; every
//! timing knob has a default:
//!
//! ```toml
//! url = "wss://sync.example.com/ws"
//! queue_path = "/var/lib/app/queue.db"
//! request_timeout_ms = 5000
//! heartbeat_interval_ms = 0   # disable the heartbeat
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rpc::TransportConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings for [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// WebSocket endpoint (`ws://` or `wss://`).
    pub url: String,
    /// SQLite file holding the durable command queue.
    pub queue_path: PathBuf,
    /// Time to wait for a response before giving up (default: 5000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Time allowed for one connection attempt (default: 10000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Delay between reconnection attempts (default: 3000).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Heartbeat interval in milliseconds (default: 30000). 0 = disabled.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Max time to wait for a heartbeat reply (default: 10000).
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Settle delay between coming online and draining the queue (default: 500).
    #[serde(default = "default_online_sync_delay_ms")]
    pub online_sync_delay_ms: u64,
    /// Minimum time in the background before foregrounding forces a
    /// reconnect (default: 0, always reconnect).
    #[serde(default)]
    pub foreground_reconnect_after_ms: u64,
    /// Reachability probe interval (default: 0, disabled).
    #[serde(default)]
    pub probe_interval_ms: u64,
    /// Reachability probe connect timeout (default: 3000).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    10000
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

fn default_heartbeat_interval_ms() -> u64 {
    30000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10000
}

fn default_online_sync_delay_ms() -> u64 {
    500
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

impl EngineConfig {
    /// Config with defaults for everything but the endpoint and queue file.
    pub fn new(url: impl Into<String>, queue_path: impl Into<PathBuf>) -> Self {
        EngineConfig {
            url: url.into(),
            queue_path: queue_path.into(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            online_sync_delay_ms: default_online_sync_delay_ms(),
            foreground_reconnect_after_ms: 0,
            probe_interval_ms: 0,
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "url '{}' must start with ws:// or wss://",
                self.url
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.queue_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("queue_path is empty".to_string()));
        }
        Ok(())
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            url: self.url.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            heartbeat_interval: (self.heartbeat_interval_ms > 0)
                .then(|| Duration::from_millis(self.heartbeat_interval_ms)),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            foreground_reconnect_after: Duration::from_millis(self.foreground_reconnect_after_ms),
        }
    }

    pub fn online_sync_delay(&self) -> Duration {
        Duration::from_millis(self.online_sync_delay_ms)
    }

    /// Probe interval, if probing is enabled.
    pub fn probe_interval(&self) -> Option<Duration> {
        (self.probe_interval_ms > 0).then(|| Duration::from_millis(self.probe_interval_ms))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
