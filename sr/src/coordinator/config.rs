//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Logical names the router addresses directly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WellKnownNames {
    /// Flight generator
    pub simulator: String,

    /// Durability endpoint; the only destination with a backlog
    pub persistence: String,

    /// Map renderer
    pub visualizer: String,
}

impl Default for WellKnownNames {
    fn default() -> Self {
        Self {
            simulator: "simulator".to_string(),
            persistence: "database".to_string(),
            visualizer: "map".to_string(),
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Interface to listen on
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Accept wake-up period so the loop can observe shutdown
    #[serde(rename = "accept-timeout-ms", default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,

    /// Time a new connection has to present its handshake
    #[serde(rename = "handshake-timeout-ms", default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Per-write timeout on an endpoint's socket
    #[serde(rename = "send-timeout-ms", default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Records queued per endpoint before it is evicted as stalled
    #[serde(rename = "outbox-capacity", default = "default_outbox_capacity")]
    pub outbox_capacity: usize,

    /// Health monitor tick
    #[serde(rename = "health-interval-secs", default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    /// Max unterminated frame size in bytes (1MB default)
    #[serde(rename = "max-frame-bytes", default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Channel buffer size for relay requests
    #[serde(rename = "channel-buffer", default = "default_channel_buffer")]
    pub channel_buffer: usize,

    /// Routing targets
    #[serde(default)]
    pub names: WellKnownNames,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5555
}

fn default_accept_timeout_ms() -> u64 {
    1000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_send_timeout_ms() -> u64 {
    5000
}

fn default_outbox_capacity() -> usize {
    1024
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024 // 1MB
}

fn default_channel_buffer() -> usize {
    1000
}

impl Default for RelayConfig {
    fn default() -> Self {
        debug!("RelayConfig::default: called");
        Self {
            host: default_host(),
            port: default_port(),
            accept_timeout_ms: default_accept_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            outbox_capacity: default_outbox_capacity(),
            health_interval_secs: default_health_interval_secs(),
            max_frame_bytes: default_max_frame_bytes(),
            channel_buffer: default_channel_buffer(),
            names: WellKnownNames::default(),
        }
    }
}

impl RelayConfig {
    /// `host:port` string to bind
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}
