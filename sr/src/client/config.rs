//! Client runtime configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::protocol::{DEFAULT_MAX_FRAME_BYTES, Role};

/// Comma-separated candidate hosts, tried in order
pub const ENV_HOSTS: &str = "COORDINATOR_HOSTS";

/// Single host, used when no host list is set
pub const ENV_HOST: &str = "COORDINATOR_HOST";

pub const ENV_PORT: &str = "COORDINATOR_PORT";

/// How a process reaches the coordinator and what it calls itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Candidate coordinator hosts in failover order
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Pause after every host in the list has failed
    #[serde(rename = "retry-delay-secs", default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Budget for connect plus handshake on one host
    #[serde(rename = "connect-timeout-ms", default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Routing name announced in the handshake
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_role")]
    pub role: Role,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(rename = "max-frame-bytes", default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_hosts() -> Vec<String> {
    vec!["localhost".to_string()]
}

fn default_port() -> u16 {
    5555
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_name() -> String {
    "control".to_string()
}

fn default_role() -> Role {
    Role::Control
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            port: default_port(),
            retry_delay_secs: default_retry_delay_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            name: default_name(),
            role: default_role(),
            version: default_version(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl ClientConfig {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            ..Default::default()
        }
    }

    /// Apply `COORDINATOR_*` environment overrides
    ///
    /// A host list wins over the single host; an unparsable port is ignored.
    pub fn with_env_overrides(mut self) -> Self {
        debug!("ClientConfig::with_env_overrides: called");
        let hosts = std::env::var(ENV_HOSTS)
            .ok()
            .map(|list| parse_host_list(&list))
            .filter(|hosts| !hosts.is_empty())
            .or_else(|| {
                std::env::var(ENV_HOST)
                    .ok()
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .map(|h| vec![h])
            });
        if let Some(hosts) = hosts {
            debug!(?hosts, "ClientConfig::with_env_overrides: hosts from environment");
            self.hosts = hosts;
        }

        if let Ok(port) = std::env::var(ENV_PORT) {
            match port.trim().parse() {
                Ok(port) => self.port = port,
                Err(e) => warn!(%port, error = %e, "Ignoring invalid {}", ENV_PORT),
            }
        }
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `host:port` candidates in failover order
    pub fn targets(&self) -> Vec<String> {
        self.hosts.iter().map(|h| format!("{}:{}", h, self.port)).collect()
    }
}

fn parse_host_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        // SAFETY: tests touching the environment are serialized
        unsafe {
            std::env::remove_var(ENV_HOSTS);
            std::env::remove_var(ENV_HOST);
            std::env::remove_var(ENV_PORT);
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: tests touching the environment are serialized
        unsafe { std::env::set_var(key, value) }
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.targets(), vec!["localhost:5555"]);
        assert_eq!(config.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.role, Role::Control);
    }

    #[test]
    fn test_parse_host_list_skips_blanks() {
        assert_eq!(parse_host_list(" a, ,b ,"), vec!["a", "b"]);
    }

    #[test]
    fn test_yaml_with_legacy_role() {
        let yaml = "hosts: [coord-a, coord-b]\nname: mapa\nrole: visualizador\nretry-delay-secs: 1\n";
        let config: ClientConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.targets(), vec!["coord-a:5555", "coord-b:5555"]);
        assert_eq!(config.role, Role::Visualizer);
        assert_eq!(config.retry_delay_secs, 1);
        assert_eq!(config.connect_timeout_ms, 5000);
    }

    #[test]
    #[serial]
    fn test_env_host_list_wins_over_single_host() {
        clear_env();
        set_env(ENV_HOSTS, "one,two");
        set_env(ENV_HOST, "solo");
        set_env(ENV_PORT, "6000");

        let config = ClientConfig::default().with_env_overrides();
        assert_eq!(config.targets(), vec!["one:6000", "two:6000"]);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_single_host_fallback() {
        clear_env();
        set_env(ENV_HOST, "solo");

        let config = ClientConfig::default().with_env_overrides();
        assert_eq!(config.hosts, vec!["solo"]);
        assert_eq!(config.port, 5555);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_invalid_port_ignored() {
        clear_env();
        set_env(ENV_PORT, "not-a-port");

        let config = ClientConfig::default().with_env_overrides();
        assert_eq!(config.port, 5555);
        assert_eq!(config.hosts, vec!["localhost"]);
        clear_env();
    }
}
