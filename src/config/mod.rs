//! Configuration module
//!
//! Handles loading and saving filedrop configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::{Endpoint, NetworkConfig as NetConfig};
use crate::protocol::{DEFAULT_CHUNK_SIZE, DEFAULT_HOST, DEFAULT_PORT};
use crate::storage::{StorageRoot, DEFAULT_CLIENT_DIR, DEFAULT_SERVER_DIR};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Host to bind to (server) or connect to (client)
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on or connect to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Streaming buffer size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Per read/write deadline in ms (unset = wait forever)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_timeout_ms: Option<u64>,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            chunk_size: default_chunk_size(),
            connect_timeout_ms: default_connect_timeout(),
            io_timeout_ms: None,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory the server writes uploads into
    #[serde(default = "default_server_dir")]
    pub server_dir: PathBuf,
    /// Directory client filenames are resolved against
    #[serde(default = "default_client_dir")]
    pub client_dir: PathBuf,
}

fn default_server_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SERVER_DIR)
}

fn default_client_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CLIENT_DIR)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            server_dir: default_server_dir(),
            client_dir: default_client_dir(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("filedrop/config.toml")),
            Some(PathBuf::from("./filedrop.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply command-line overrides
    pub fn with_overrides(mut self, host: Option<String>, port: Option<u16>) -> Self {
        if let Some(host) = host {
            self.network.host = host;
        }
        if let Some(port) = port {
            self.network.port = port;
        }
        self
    }

    /// Build the explicit network settings shared by both roles
    pub fn network_config(&self) -> NetConfig {
        NetConfig {
            endpoint: Endpoint::new(self.network.host.clone(), self.network.port),
            chunk_size: self.network.chunk_size.max(1),
            connect_timeout: Some(Duration::from_millis(self.network.connect_timeout_ms)),
            io_timeout: self.network.io_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Storage root for received files
    pub fn server_storage(&self) -> StorageRoot {
        StorageRoot::new(self.storage.server_dir.clone())
    }
}

/// Sample configuration for `config --generate`
pub fn sample_config() -> Config {
    Config {
        network: NetworkConfig {
            host: "0.0.0.0".to_string(),
            io_timeout_ms: Some(30_000),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.storage.server_dir, PathBuf::from("server-storage"));
        assert_eq!(config.storage.client_dir, PathBuf::from("client-storage"));
        assert!(config.network.io_timeout_ms.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.network.port = 9090;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, 9090);
        assert_eq!(loaded.network.host, config.network.host);
    }

    #[test]
    fn test_load_missing() {
        let dir = tempdir().unwrap();
        let err = Config::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml::from_str("[network]\nport = 7000\n").unwrap();
        assert_eq!(parsed.network.port, 7000);
        assert_eq!(parsed.network.host, DEFAULT_HOST);
        assert_eq!(parsed.network.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(parsed.storage.server_dir, PathBuf::from(DEFAULT_SERVER_DIR));
    }

    #[test]
    fn test_sample_config_written_to_new_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/filedrop.toml");

        sample_config().save(&path).unwrap();

        let parsed = Config::load(&path).unwrap();
        assert_eq!(parsed.network.host, "0.0.0.0");
        assert_eq!(parsed.network.io_timeout_ms, Some(30_000));
        assert_eq!(parsed.storage.client_dir, PathBuf::from(DEFAULT_CLIENT_DIR));
    }

    #[test]
    fn test_overrides_and_network_config() {
        let config = Config::default().with_overrides(Some("localhost".to_string()), Some(9000));
        let net = config.network_config();
        assert_eq!(net.endpoint, Endpoint::new("localhost", 9000));
        assert_eq!(net.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(net.connect_timeout, Some(Duration::from_millis(5000)));
        assert_eq!(net.io_timeout, None);

        let unchanged = Config::default().with_overrides(None, None);
        assert_eq!(unchanged.network.port, DEFAULT_PORT);
    }
}
