//! Client configuration
//!
//! Loads configuration from config.toml at startup. All timing and
//! reconnect parameters are configurable to avoid hardcoded constants.

use crate::core::asset::DEFAULT_SERVER;
use crate::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Venue client configuration
///
/// Loaded from config.toml at startup, or built with `Default` and
/// adjusted field by field.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Venue WebSocket endpoint
    #[serde(default = "default_url")]
    pub url: String,

    /// Trade against the demo account
    #[serde(default = "default_demo")]
    pub demo: bool,

    /// Transport connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// How long to wait for an auth rejection before treating the
    /// handshake as accepted, in seconds
    #[serde(default = "default_auth_grace")]
    pub auth_grace_secs: u64,

    /// Default deadline for a correlated call, in seconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Keepalive probe interval in seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Inbound silence beyond ping_interval * stale_multiplier marks the
    /// connection stale
    #[serde(default = "default_stale_multiplier")]
    pub stale_multiplier: u32,

    /// First reconnect backoff in milliseconds; doubles per failed attempt
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    /// Backoff ceiling in seconds
    #[serde(default = "default_reconnect_cap")]
    pub reconnect_cap_secs: u64,

    /// Consecutive failed attempts before the session closes terminally
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,

    /// Extra wait beyond a deal's expiration before its outcome is
    /// reported Unknown, in seconds
    #[serde(default = "default_resolution_grace")]
    pub resolution_grace_secs: u64,

    /// Interval of the open-trades polling fallback while awaiting a
    /// deal resolution, in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            demo: default_demo(),
            connect_timeout_secs: default_connect_timeout(),
            auth_grace_secs: default_auth_grace(),
            call_timeout_secs: default_call_timeout(),
            ping_interval_secs: default_ping_interval(),
            stale_multiplier: default_stale_multiplier(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_cap_secs: default_reconnect_cap(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            resolution_grace_secs: default_resolution_grace(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn default_url() -> String {
    DEFAULT_SERVER.to_string()
}

fn default_demo() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_auth_grace() -> u64 {
    3
}

fn default_call_timeout() -> u64 {
    10
}

fn default_ping_interval() -> u64 {
    30
}

fn default_stale_multiplier() -> u32 {
    3
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_reconnect_cap() -> u64 {
    60
}

fn default_reconnect_max_attempts() -> u32 {
    10
}

fn default_resolution_grace() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    5
}

impl ClientConfig {
    /// Load configuration from config.toml
    ///
    /// Honors the CONFIG_PATH environment variable. A missing file yields
    /// the defaults; a file that exists but does not parse is an error.
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| ClientError::InvalidArgument(format!("config parse: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ClientError::Io(e)),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn auth_grace(&self) -> Duration {
        Duration::from_secs(self.auth_grace_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_secs(self.reconnect_cap_secs)
    }

    pub fn resolution_grace(&self) -> Duration {
        Duration::from_secs(self.resolution_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
