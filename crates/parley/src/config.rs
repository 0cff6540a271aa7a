//! Gateway configuration.
//!
//! Loaded by the binary from defaults, the TOML config file and `PARLEY__*`
//! environment variables, in that order of precedence.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    /// HTTP listener configuration.
    pub server: ServerConfig,
    /// Upstream agent connection.
    pub upstream: UpstreamConfig,
    /// Stream relay behavior.
    pub relay: RelayConfig,
    /// Two-tier history store.
    pub history: HistoryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            paths: PathsConfig::default(),
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            relay: RelayConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level used when no verbosity flag is given.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding the default database. Defaults to the XDG data dir.
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: Vec::new(),
        }
    }
}

/// Upstream agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the agent (e.g., "http://localhost:8000").
    pub base_url: String,
    /// Header carrying the caller identity, forwarded alongside `Authorization`.
    pub identity_header: String,
    /// Connect timeout for every upstream request.
    pub connect_timeout_secs: u64,
    /// Total timeout for non-streaming commands. Streams have no deadline.
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            identity_header: "x-user-id".to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 120,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Interval between heartbeat comment frames.
    pub heartbeat_interval_secs: u64,
    /// Capacity of the per-connection forwarding channel.
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            channel_capacity: 64,
        }
    }
}

impl RelayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// How long cached histories stay valid.
    pub cache_ttl_secs: u64,
    /// SQLite database holding subject aggregates. Defaults to
    /// `<data_dir>/parley.db`.
    pub database_path: Option<PathBuf>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            database_path: None,
        }
    }
}

impl HistoryConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_sections() {
        let value = toml::Value::try_from(AppConfig::default()).unwrap();
        let table = value.as_table().unwrap();
        let mut sections: Vec<&str> = table.keys().map(String::as_str).collect();
        sections.sort_unstable();
        assert_eq!(
            sections,
            vec!["history", "logging", "paths", "relay", "server", "upstream"]
        );
        let logging: Vec<&str> = table["logging"]
            .as_table()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(logging, vec!["level"]);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            port = 9090

            [relay]
            heartbeat_interval_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.relay.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.history.cache_ttl(), Duration::from_secs(300));
    }
}
