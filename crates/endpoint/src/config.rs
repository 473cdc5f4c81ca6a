//! Configuration management for XMN endpoints.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/xmn/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use xmn_protocol::{IvMode, ServerPrivateKey, ServerPublicKey, ShortCode, UniqueId};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("short_code is invalid: {0}")]
    InvalidShortCode(String),

    #[error("unique_id is invalid: {0}")]
    InvalidUniqueId(String),

    #[error("host must not be empty")]
    EmptyHost,

    #[error("housekeeping_interval_ms must be greater than 0")]
    InvalidHousekeepingInterval,

    #[error("ping_interval_ms ({ping}) must be at least housekeeping_interval_ms ({housekeeping})")]
    InvalidPingInterval { ping: u64, housekeeping: u64 },

    #[error("listen_addr must be a socket address, got {0}")]
    InvalidListenAddr(String),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for XMN endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Client endpoint configuration.
    pub client: ClientConfig,

    /// Wire protocol tuning shared by both endpoints.
    pub protocol: ProtocolConfig,

    /// Server endpoint configuration.
    pub server: ServerConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Client endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,

    /// Server port; omitted from the URL when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Connect on the public path instead of the private one.
    pub public: bool,

    /// Application short code, up to 4 alphanumeric characters.
    pub short_code: String,

    /// Installation id, `a.b.c` or an integer up to 999999.
    pub unique_id: String,

    /// Path to the server's RSA public key (PEM).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_public_key: Option<PathBuf>,
}

/// Wire protocol tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Bodies above this many bytes are considered for deflate.
    pub compression_threshold: usize,

    /// Idle time before a ping is sent.
    pub ping_interval_ms: u64,

    /// Period of the pending-table sweep.
    pub housekeeping_interval_ms: u64,

    /// Sent requests older than this fail with a timeout (0 = never).
    pub request_timeout_ms: u64,

    /// How AES-CBC initialization vectors are chosen.
    pub iv_mode: IvMode,
}

/// Server endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to accept websocket connections on.
    pub listen_addr: String,

    /// Path to the server's RSA private key (PKCS#8 PEM).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PathBuf>,

    /// Ping interval pushed to clients on connect (0 = don't push).
    pub ping_interval_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: Some(9090),
            public: true,
            short_code: "XMN".to_string(),
            unique_id: "0.0.1".to_string(),
            server_public_key: None,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            compression_threshold: xmn_protocol::COMPRESSION_THRESHOLD,
            ping_interval_ms: 30_000,
            housekeeping_interval_ms: 1_000,
            request_timeout_ms: 60_000,
            iv_mode: IvMode::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9090".to_string(),
            private_key: None,
            ping_interval_ms: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Parsed short code.
    pub fn short_code(&self) -> xmn_protocol::Result<ShortCode> {
        ShortCode::new(self.short_code.as_str())
    }

    /// Parsed unique id.
    pub fn unique_id(&self) -> xmn_protocol::Result<UniqueId> {
        self.unique_id.parse()
    }

    /// Loads the server public key from `server_public_key`.
    pub fn load_server_public_key(&self) -> Result<ServerPublicKey> {
        let path = self
            .server_public_key
            .as_ref()
            .context("client.server_public_key is not set")?;
        let pem = fs::read_to_string(path)
            .with_context(|| format!("Failed to read server public key: {}", path.display()))?;
        ServerPublicKey::from_pem(&pem)
            .with_context(|| format!("Failed to parse server public key: {}", path.display()))
    }
}

impl ProtocolConfig {
    /// Ping interval as a duration.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Housekeeping interval as a duration.
    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }

    /// Request timeout, `None` when disabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

impl ServerConfig {
    /// Loads the server private key from `private_key`.
    pub fn load_private_key(&self) -> Result<ServerPrivateKey> {
        let path = self
            .private_key
            .as_ref()
            .context("server.private_key is not set")?;
        let pem = fs::read_to_string(path)
            .with_context(|| format!("Failed to read server private key: {}", path.display()))?;
        ServerPrivateKey::from_pem(&pem)
            .with_context(|| format!("Failed to parse server private key: {}", path.display()))
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("xmn")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - XMN_HOST: Override the client's server host
    /// - XMN_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - XMN_PING_INTERVAL_MS: Override the keep-alive interval
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("XMN_HOST") {
            if !host.is_empty() {
                tracing::info!("Overriding host from environment: {}", host);
                self.client.host = host;
            }
        }

        if let Ok(level) = std::env::var("XMN_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }

        if let Ok(ms) = std::env::var("XMN_PING_INTERVAL_MS") {
            match ms.parse::<u64>() {
                Ok(ms) => {
                    tracing::info!("Overriding ping_interval_ms from environment: {}", ms);
                    self.protocol.ping_interval_ms = ms;
                }
                Err(_) if ms.is_empty() => {}
                Err(e) => tracing::warn!("Ignoring XMN_PING_INTERVAL_MS={:?}: {}", ms, e),
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        self.client
            .short_code()
            .map_err(|e| ConfigError::InvalidShortCode(e.to_string()))?;
        self.client
            .unique_id()
            .map_err(|e| ConfigError::InvalidUniqueId(e.to_string()))?;

        let housekeeping = self.protocol.housekeeping_interval_ms;
        if housekeeping == 0 {
            return Err(ConfigError::InvalidHousekeepingInterval);
        }

        let ping = self.protocol.ping_interval_ms;
        if ping < housekeeping {
            return Err(ConfigError::InvalidPingInterval { ping, housekeeping });
        }

        if self.server.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(self.server.listen_addr.clone()));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Install a global fmt subscriber at the configured level.
    ///
    /// `RUST_LOG` takes precedence when set. Calling this more than once is a
    /// no-op.
    pub fn init_tracing(&self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.logging.level.to_lowercase()));
        if tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .is_err()
        {
            tracing::debug!("Tracing subscriber already installed");
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
