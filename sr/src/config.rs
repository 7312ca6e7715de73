//! SkyRelay configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::client::ClientConfig;
use crate::coordinator::RelayConfig;

/// Project-local config file name
pub const LOCAL_CONFIG: &str = ".skyrelay.yml";

/// Main SkyRelay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Coordinator settings for `sr serve`
    pub relay: RelayConfig,

    /// Connection settings for `sr send` and `sr watch`
    pub client: ClientConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .skyrelay.yml
        let local_config = PathBuf::from(LOCAL_CONFIG);
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/skyrelay/skyrelay.yml
        if let Some(user_config) = user_config_path()
            && user_config.exists()
        {
            match Self::load_from_file(&user_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    ///
    /// Errors are swallowed; the full load reports them once logging works.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => std::iter::once(PathBuf::from(LOCAL_CONFIG))
                .chain(user_config_path())
                .collect(),
        };
        candidates
            .into_iter()
            .find(|p| p.exists())
            .and_then(|p| Self::load_from_file(p).ok())
            .and_then(|c| c.log_level)
    }

    /// Config as YAML, as printed by `sr config`
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config")
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("skyrelay").join("skyrelay.yml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.relay.port, 5555);
        assert_eq!(config.relay.names.persistence, "database");
        assert_eq!(config.client.hosts, vec!["localhost"]);
        assert!(config.log_level.is_none());
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
log-level: debug
relay:
  port: 6000
  health-interval-secs: 5
  names:
    persistence: db
client:
  hosts: [a, b]
  name: mapa
  role: visualizador
"#
        )
        .unwrap();

        let config = Config::load(Some(&file.path().to_path_buf())).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.relay.port, 6000);
        assert_eq!(config.relay.health_interval_secs, 5);
        assert_eq!(config.relay.host, "0.0.0.0");
        assert_eq!(config.relay.names.persistence, "db");
        assert_eq!(config.relay.names.simulator, "simulator");
        assert_eq!(config.client.hosts, vec!["a", "b"]);
        assert_eq!(config.client.role, Role::Visualizer);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let path = PathBuf::from("/nonexistent/skyrelay.yml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_load_invalid_yaml_fails() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "relay: [not, a, map").unwrap();
        assert!(Config::load(Some(&file.path().to_path_buf())).is_err());
    }

    #[test]
    fn test_load_log_level_early() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "log-level: TRACE").unwrap();
        assert_eq!(
            Config::load_log_level(Some(&file.path().to_path_buf())).as_deref(),
            Some("TRACE")
        );
        assert_eq!(Config::load_log_level(Some(&PathBuf::from("/nonexistent.yml"))), None);
    }

    #[test]
    fn test_yaml_round_trip_keeps_kebab_keys() {
        let yaml = Config::default().to_yaml().unwrap();
        assert!(yaml.contains("health-interval-secs"));
        assert!(yaml.contains("retry-delay-secs"));
        assert!(!yaml.contains("log-level"));
    }
}
