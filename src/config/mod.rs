//! # Configuration Management Module
//!
//! This module loads and writes the `config.toml` file that drives the groupbbs
//! server. Every section has defaults so a partially filled file still loads.
//!
//! ## Configuration Structure
//!
//! - [`ServerConfig`] - Listening endpoint, framing limits and session tuning
//! - [`StorageConfig`] - Snapshot locations
//! - [`LoggingConfig`] - Logging level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use groupbbs::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Load configuration from file
//!     let config = Config::load("config.toml").await?;
//!     println!("Listening on {}", config.server.bind_address());
//!
//!     // Create default configuration
//!     Config::create_default("config.toml").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [server]
//! name = "groupbbs"
//! host = "127.0.0.1"
//! port = 1024
//! backlog = 16
//!
//! [storage]
//! data_dir = "./data"
//!
//! [logging]
//! level = "info"
//! ```
//!
//! CLI arguments take precedence over values from the file.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Display name announced in logs and the help banner.
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Queued-but-unaccepted connections allowed by the listening socket.
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Largest accepted frame payload in bytes (both directions).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Per-session queue of outgoing frames; notices are dropped when full.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    /// Upper bound for one socket write before the session is considered stalled.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// How long shutdown waits for sessions to finish before persisting.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Periodic snapshot interval in seconds (0 disables autosave).
    #[serde(default)]
    pub autosave_interval_secs: u64,
}

fn default_server_name() -> String {
    "groupbbs".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1024
}

fn default_backlog() -> u32 {
    16
}

fn default_max_frame_bytes() -> usize {
    8 * 1024
}

fn default_outbox_capacity() -> usize {
    64
}

fn default_write_timeout_ms() -> u64 {
    5000
}

fn default_drain_timeout_secs() -> u64 {
    5
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Autosave period, or `None` when disabled.
    pub fn autosave_interval(&self) -> Option<Duration> {
        if self.autosave_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.autosave_interval_secs))
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_frame_bytes: default_max_frame_bytes(),
            outbox_capacity: default_outbox_capacity(),
            write_timeout_ms: default_write_timeout_ms(),
            drain_timeout_secs: default_drain_timeout_secs(),
            autosave_interval_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Group membership snapshot file name, relative to `data_dir`.
    #[serde(default = "default_groups_file")]
    pub groups_file: String,
    /// Board/message snapshot file name, relative to `data_dir`.
    #[serde(default = "default_boards_file")]
    pub boards_file: String,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_groups_file() -> String {
    "groups.json".to_string()
}

fn default_boards_file() -> String {
    "boards.json".to_string()
}

impl StorageConfig {
    pub fn groups_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.groups_file)
    }

    pub fn boards_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.boards_file)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            groups_file: default_groups_file(),
            boards_file: default_boards_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("groupbbs.log".to_string()),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 1024);
        assert_eq!(config.backlog, 16);
        assert_eq!(config.bind_address(), "127.0.0.1:1024");
        assert!(config.autosave_interval().is_none());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let raw = r#"
            [server]
            port = 4000
            autosave_interval_secs = 30

            [storage]
            data_dir = "/tmp/bbs"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.max_frame_bytes, 8192);
        assert_eq!(config.server.autosave_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.storage.groups_path(), PathBuf::from("/tmp/bbs/groups.json"));
        assert_eq!(config.storage.boards_path(), PathBuf::from("/tmp/bbs/boards.json"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.outbox_capacity, 64);
        assert_eq!(config.storage.data_dir, "./data");
    }

    #[test]
    fn test_config_toml_round_trip() {
        let mut config = Config::default();
        config.server.port = 2048;
        config.logging.file = None;
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.server.port, 2048);
        assert!(parsed.logging.file.is_none());
        assert_eq!(parsed.storage.groups_file, "groups.json");
    }

    #[tokio::test]
    async fn test_create_default_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let config = Config::load(path).await.unwrap();
        assert_eq!(config.server.name, "groupbbs");
    }

    #[tokio::test]
    async fn test_load_missing_file_errors() {
        let err = Config::load("/definitely/not/here.toml").await.unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
