//! Configuration management module for the tunnel service and its clients.
//!
//! This module provides functionality for loading, parsing, and managing
//! configuration settings shared by `tunneld` and `tunnelctl`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Default location of the service socket.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/tunneld/tunneld.sock";

/// Service (daemon) configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Path of the Unix Domain Socket the service listens on
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// File mode applied to the socket (default: 0o660)
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Capacity of the notification fan-out queue. A client that falls
    /// further behind than this is told to resync.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_socket_path() -> String {
    DEFAULT_SOCKET_PATH.to_string()
}

fn default_socket_mode() -> u32 {
    0o660
}

fn default_event_queue_capacity() -> usize {
    256
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            socket_path: default_socket_path(),
            socket_mode: default_socket_mode(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

/// Which dataplane implementation the service drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataplaneKind {
    /// Bring-up and tear-down always succeed without side effects
    #[default]
    Null,
    /// Bring-up and tear-down run external commands
    Script,
}

/// Dataplane configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataplaneConfig {
    /// Implementation to use (default: null)
    #[serde(default)]
    pub kind: DataplaneKind,

    /// Command run to bring a tunnel up (script dataplane)
    pub up_command: Option<String>,

    /// Command run to tear a tunnel down (script dataplane)
    pub down_command: Option<String>,

    /// Command printing the names of tunnels already running, one per line
    pub discover_command: Option<String>,

    /// Directory where tunnel configurations are written for the commands
    #[serde(default = "default_config_dir")]
    pub config_dir: String,

    /// Optional limit on a single bring-up or tear-down, in seconds
    pub timeout_secs: Option<u64>,
}

fn default_config_dir() -> String {
    "/var/run/tunneld/configs".to_string()
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        DataplaneConfig {
            kind: DataplaneKind::default(),
            up_command: None,
            down_command: None,
            discover_command: None,
            config_dir: default_config_dir(),
            timeout_secs: None,
        }
    }
}

impl DataplaneConfig {
    /// Returns the command timeout as a [`Duration`], if one is configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Client-specific configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Path of the service socket to connect to
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// How long to wait for a response to a single request, in seconds.
    /// Start and stop wait for the dataplane, so keep this generous.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            socket_path: default_socket_path(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ClientConfig {
    /// Returns the request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON (default: false)
    #[serde(default)]
    pub log_json: bool,

    /// Directory for daily-rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Dataplane configuration
    #[serde(default)]
    pub dataplane: DataplaneConfig,

    /// Client configuration
    #[serde(default)]
    pub client: ClientConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            log_json: false,
            log_dir: None,
            service: ServiceConfig::default(),
            dataplane: DataplaneConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        config.validate()?;

        // Environment variables take precedence over the file
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log_level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "log_level".to_string(),
                    message: format!("unknown level '{other}'"),
                });
            }
        }

        if self.service.socket_path.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "service.socket_path".to_string(),
                message: "socket path cannot be empty".to_string(),
            });
        }

        if self.service.socket_mode > 0o777 {
            return Err(ConfigError::InvalidValue {
                key: "service.socket_mode".to_string(),
                message: format!("{:o} is not a permission mode", self.service.socket_mode),
            });
        }

        if self.service.event_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "service.event_queue_capacity".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.dataplane.kind == DataplaneKind::Script {
            if self.dataplane.up_command.is_none() {
                return Err(ConfigError::MissingValue(
                    "dataplane.up_command must be provided when kind=script".to_string(),
                ));
            }
            if self.dataplane.down_command.is_none() {
                return Err(ConfigError::MissingValue(
                    "dataplane.down_command must be provided when kind=script".to_string(),
                ));
            }
        }

        if self.dataplane.timeout_secs == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "dataplane.timeout_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.client.socket_path.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "client.socket_path".to_string(),
                message: "socket path cannot be empty".to_string(),
            });
        }

        if self.client.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "client.request_timeout_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Apply overrides (prefix: TUNNEL_) looked up through `lookup`.
    ///
    /// Keys:
    /// - TUNNEL_LOG_LEVEL, TUNNEL_LOG_JSON, TUNNEL_LOG_DIR
    /// - TUNNEL_SERVICE_SOCKET_PATH, TUNNEL_SERVICE_EVENT_QUEUE_CAPACITY
    /// - TUNNEL_DATAPLANE_KIND, TUNNEL_DATAPLANE_UP_COMMAND, TUNNEL_DATAPLANE_DOWN_COMMAND,
    ///   TUNNEL_DATAPLANE_TIMEOUT_SECS
    /// - TUNNEL_CLIENT_SOCKET_PATH, TUNNEL_CLIENT_REQUEST_TIMEOUT_SECS
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_bool(s: &str) -> Option<bool> {
            match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Some(true),
                "false" | "0" | "no" | "n" => Some(false),
                _ => None,
            }
        }
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        // Top-level
        if let Some(v) = non_empty("TUNNEL_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(b) = lookup("TUNNEL_LOG_JSON").as_deref().and_then(parse_bool) {
            self.log_json = b;
        }
        if let Some(v) = non_empty("TUNNEL_LOG_DIR") {
            self.log_dir = Some(v);
        }

        // Service
        if let Some(v) = non_empty("TUNNEL_SERVICE_SOCKET_PATH") {
            self.service.socket_path = v;
        }
        if let Some(n) = lookup("TUNNEL_SERVICE_EVENT_QUEUE_CAPACITY").and_then(|v| v.parse().ok())
        {
            self.service.event_queue_capacity = n;
        }

        // Dataplane
        if let Some(v) = lookup("TUNNEL_DATAPLANE_KIND") {
            self.dataplane.kind = match v.to_ascii_lowercase().as_str() {
                "script" => DataplaneKind::Script,
                "null" => DataplaneKind::Null,
                _ => self.dataplane.kind,
            };
        }
        if let Some(v) = non_empty("TUNNEL_DATAPLANE_UP_COMMAND") {
            self.dataplane.up_command = Some(v);
        }
        if let Some(v) = non_empty("TUNNEL_DATAPLANE_DOWN_COMMAND") {
            self.dataplane.down_command = Some(v);
        }
        if let Some(n) = lookup("TUNNEL_DATAPLANE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.dataplane.timeout_secs = Some(n);
        }

        // Client
        if let Some(v) = non_empty("TUNNEL_CLIENT_SOCKET_PATH") {
            self.client.socket_path = v;
        }
        if let Some(n) = lookup("TUNNEL_CLIENT_REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok())
        {
            self.client.request_timeout_secs = n;
        }
    }

    /// Reload configuration from the same file it was loaded from
    pub fn reload(&mut self, path: &Path) -> Result<(), ConfigError> {
        *self = Self::load(path)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("tunneld").join("config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }

    /// Load `path` when it exists, otherwise fall back to defaults with
    /// environment overrides applied.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::FileNotFound(_)) => {
                let mut config = Config::default();
                config.apply_overrides(|key| std::env::var(key).ok());
                config.validate()?;
                Ok(config)
            }
            other => other,
        }
    }
}

/// Configuration manager for handling configuration loading and reloading.
#[derive(Debug)]
pub struct ConfigManager {
    /// Current configuration
    config: Config,
    /// Path to the configuration file
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new configuration manager with the default configuration
    pub fn new() -> Self {
        ConfigManager {
            config: Config::default(),
            config_path: Config::default_path(),
        }
    }

    /// Load configuration from the specified path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = Config::load(&path)?;

        Ok(ConfigManager {
            config,
            config_path: path,
        })
    }

    /// Get a reference to the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a mutable reference to the current configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Reload configuration from the current path
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        self.config.reload(&self.config_path)
    }

    /// Save the current configuration to the current path
    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.save(&self.config_path)
    }

    /// Get the current configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
