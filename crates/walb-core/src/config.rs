//! Configuration management for the WalB daemons.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration shared by the three daemon roles.
///
/// A single TOML file configures every role; each daemon reads the common
/// `server` and `logging` sections plus its own role section.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Common server configuration.
    pub server: ServerConfig,
    /// Storage daemon configuration.
    pub storage: StorageConfig,
    /// Proxy daemon configuration.
    pub proxy: ProxyConfig,
    /// Archive daemon configuration.
    pub archive: ArchiveConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(Error::Io)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Common server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the protocol listener.
    pub bind: SocketAddr,
    /// Node identifier used in the protocol greeting.
    pub node_id: String,
    /// Socket timeout in seconds.
    pub socket_timeout_secs: u64,
    /// Maximum concurrent foreground protocol handlers.
    pub max_foreground_tasks: usize,
    /// Maximum concurrent background tasks.
    pub max_background_tasks: usize,
    /// Waiting time before a client retries a failed transfer, in seconds.
    pub retry_delay_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".parse().expect("valid default addr"),
            node_id: String::new(),
            socket_timeout_secs: 60,
            max_foreground_tasks: 2,
            max_background_tasks: 1,
            retry_delay_secs: 20,
        }
    }
}

impl ServerConfig {
    /// Socket timeout as a `Duration`.
    #[must_use]
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    /// Retry delay as a `Duration`.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Storage daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for volume directories.
    pub base_dir: PathBuf,
    /// Proxy daemons, in preference order.
    pub proxies: Vec<SocketAddr>,
    /// The archive daemon this storage reports to.
    pub archive: Option<SocketAddr>,
    /// Maximum wlog size to send at once, in MiB.
    pub max_wlog_send_mb: u64,
    /// Polling interval of the wdev monitor, in milliseconds.
    pub wdev_poll_interval_ms: u64,
    /// Polling interval of the proxy monitor, in milliseconds.
    pub proxy_poll_interval_ms: u64,
    /// Read-ahead buffer size for the log device reader, in bytes.
    pub read_ahead_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/walb/storage"),
            proxies: Vec::new(),
            archive: None,
            max_wlog_send_mb: 128,
            wdev_poll_interval_ms: 1000,
            proxy_poll_interval_ms: 1000,
            read_ahead_bytes: 4 << 20,
        }
    }
}

/// Proxy daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Base directory for volume directories.
    pub base_dir: PathBuf,
    /// Maximum total wdiff bytes merged into one transfer.
    pub max_wdiff_send_size: u64,
    /// Maximum number of wdiff files merged into one transfer.
    pub max_wdiff_send_nr: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/walb/proxy"),
            max_wdiff_send_size: 128 << 20,
            max_wdiff_send_nr: 64,
        }
    }
}

/// Archive daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Base directory for volume directories.
    pub base_dir: PathBuf,
    /// How many times to retry opening the diff set during restore
    /// before giving up.
    pub restore_max_retry: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self { base_dir: PathBuf::from("/var/walb/archive"), restore_max_retry: 10 }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text.
    #[default]
    Text,
    /// Structured JSON.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Text }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.max_foreground_tasks, 2);
        assert_eq!(config.storage.max_wlog_send_mb, 128);
        assert_eq!(config.archive.restore_max_retry, 10);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            r#"
            [server]
            bind = "0.0.0.0:5100"
            node_id = "s0"

            [storage]
            base_dir = "/tmp/walb/s0"
            proxies = ["127.0.0.1:5200"]
            max_wlog_send_mb = 16

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.bind.port(), 5100);
        assert_eq!(config.server.node_id, "s0");
        assert_eq!(config.storage.proxies.len(), 1);
        assert_eq!(config.storage.max_wlog_send_mb, 16);
        // Untouched sections keep defaults.
        assert_eq!(config.proxy.max_wdiff_send_nr, 64);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = Config::from_toml("server = 3").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
