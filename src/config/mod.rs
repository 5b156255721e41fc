//! Configuration module
//!
//! Handles loading and saving node controller configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::protocol::{request_subject, DEFAULT_PORT, DEFAULT_SUBJECT, DEFAULT_TIMEOUT_MS};

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
    /// Message bus connection
    #[serde(default)]
    pub bus: BusConfig,

    /// Identity of this node
    #[serde(default)]
    pub node: NodeConfig,

    /// Hardware backend
    #[serde(default)]
    pub backend: BackendConfig,

    /// Request client settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging
    #[serde(default)]
    pub log: LogConfig,
}

/// Message bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus server host
    #[serde(default = "default_server")]
    pub server: String,
    /// Bus server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username, used together with `password`
    pub username: Option<String>,
    pub password: Option<String>,
    /// NATS credentials file
    pub credentials_file: Option<PathBuf>,
    /// Subject prefix; requests for a node go to `<subject>.<hostname>`
    #[serde(default = "default_subject")]
    pub subject: String,
    /// Explicit subject for the server to consume from
    pub request_subject: Option<String>,
    /// Inbound queue depth
    #[serde(default = "default_outstanding_messages")]
    pub outstanding_messages: usize,
}

fn default_server() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_subject() -> String {
    DEFAULT_SUBJECT.to_string()
}

fn default_outstanding_messages() -> usize {
    256
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            port: default_port(),
            username: None,
            password: None,
            credentials_file: None,
            subject: default_subject(),
            request_subject: None,
            outstanding_messages: default_outstanding_messages(),
        }
    }
}

impl BusConfig {
    /// Server URL; a server given with a scheme is used as-is
    pub fn address(&self) -> String {
        if self.server.contains("://") {
            self.server.clone()
        } else {
            format!("nats://{}:{}", self.server, self.port)
        }
    }

    /// Subject the server for `hostname` consumes from
    pub fn server_subject(&self, hostname: &str) -> String {
        self.request_subject
            .clone()
            .unwrap_or_else(|| request_subject(&self.subject, hostname))
    }
}

/// Node identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Hostname override (system hostname if not set)
    pub hostname: Option<String>,
}

impl NodeConfig {
    pub fn hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "localhost".to_string())
        })
    }
}

/// Which capability backend serves knob requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sysfs,
    Simulated,
}

/// Backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    /// Root of the sysfs tree
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            sysfs_root: default_sysfs_root(),
        }
    }
}

/// Request client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Reply timeout in ms
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,
    /// Log file path (stderr if not set)
    pub file: Option<PathBuf>,
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
            dirs::config_dir().map(|p| p.join("node-controller/config.toml")),
            Some(PathBuf::from("./node-controller.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

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
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        bus: BusConfig {
            server: "nats.example.org".to_string(),
            username: Some("controller".to_string()),
            password: Some("secret".to_string()),
            ..Default::default()
        },
        node: NodeConfig {
            hostname: Some("node001".to_string()),
        },
        log: LogConfig {
            debug: false,
            file: Some(PathBuf::from("/var/log/node-controller.log")),
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bus.port, DEFAULT_PORT);
        assert_eq!(config.bus.subject, "cc-control");
        assert_eq!(config.bus.outstanding_messages, 256);
        assert_eq!(config.backend.kind, BackendKind::Sysfs);
        assert_eq!(config.client.timeout_ms, 1000);
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.node.hostname = Some("nodeA".to_string());
        config.backend.kind = BackendKind::Simulated;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.node.hostname.as_deref(), Some("nodeA"));
        assert_eq!(loaded.backend, config.backend);
        assert_eq!(loaded.bus, config.bus);
    }

    #[test]
    fn test_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[bus]\nserver = \"10.0.0.1\"\n\n[backend]\nkind = \"simulated\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.bus.address(), "nats://10.0.0.1:4222");
        assert_eq!(config.bus.subject, "cc-control");
        assert_eq!(config.backend.kind, BackendKind::Simulated);
        assert_eq!(config.backend.sysfs_root, PathBuf::from("/sys"));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::load(&dir.path().join("absent.toml")),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_server_subject() {
        let mut bus = BusConfig::default();
        assert_eq!(bus.server_subject("nodeA"), "cc-control.nodeA");
        bus.request_subject = Some("controls.in".to_string());
        assert_eq!(bus.server_subject("nodeA"), "controls.in");

        bus.server = "tls://nats.example.org:4443".to_string();
        assert_eq!(bus.address(), "tls://nats.example.org:4443");
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.node.hostname.as_deref(), Some("node001"));
        assert_eq!(parsed.bus.server, "nats.example.org");
    }
}
