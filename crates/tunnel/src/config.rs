//! Configuration management for the Diode tunnel client.
//!
//! This module provides TOML-based configuration file loading.
//! The default configuration path is `~/.config/diode-tunnel/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::Address;
use serde::Deserialize;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("server host must not be empty")]
    EmptyHost,

    #[error("server port must be greater than 0")]
    InvalidServerPort,

    #[error("{0} must be greater than 0 seconds")]
    InvalidTimeout(&'static str),

    #[error("fleet_contract must be a 20-byte hex address, got {0}")]
    InvalidFleetContract(String),

    #[error("bind device must be a 20-byte hex address, got {0}")]
    InvalidDeviceId(String),

    #[error("bind local_port must be greater than 0")]
    InvalidBindPort,

    #[error("publish ports must be greater than 0")]
    InvalidPublishPort,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the tunnel client.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Relay server to connect to.
    pub server: ServerConfig,

    /// Client certificate and key.
    pub identity: IdentityConfig,

    /// Ticket parameters.
    pub ticket: TicketConfig,

    /// Logging configuration.
    pub log: LogConfig,

    /// Published local ports.
    pub publish: PublishConfig,

    /// Local ports tunnelled to remote devices.
    pub bind: Vec<BindConfig>,
}

/// Relay server configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Host name of the relay.
    pub host: String,

    /// TLS port of the relay.
    pub port: u16,

    /// Timeout for establishing the transport session.
    pub connect_timeout_secs: u64,

    /// Timeout for a single request.
    pub request_timeout_secs: u64,
}

/// Client identity configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    /// PEM file holding both the client certificate and its private key.
    pub cert_path: PathBuf,
}

/// Ticket configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TicketConfig {
    /// Chain id signed into every ticket.
    pub chain_id: u64,

    /// Fleet contract address, hex with optional `0x`.
    pub fleet_contract: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

/// One local port tunnelled to a port on a remote device.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BindConfig {
    /// Local TCP port to listen on.
    pub local_port: u16,

    /// Remote device address, hex with optional `0x`.
    pub device: String,

    /// Port on the remote device.
    pub remote_port: u16,

    /// Channel flags passed to `portopen`.
    #[serde(default = "default_bind_flags")]
    pub flags: String,
}

/// Publish configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublishConfig {
    /// Ports remote devices may open.
    pub ports: Vec<u16>,

    /// Host the published services listen on.
    pub local_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "eu2.prenet.diode.io".to_string(),
            port: 41046,
            connect_timeout_secs: 30,
            request_timeout_secs: 30,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("device_certificate.pem"),
        }
    }
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            chain_id: 15,
            fleet_contract: "0x6000000000000000000000000000000000000000".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            local_host: "127.0.0.1".to_string(),
        }
    }
}

fn default_bind_flags() -> String {
    "rw".to_string()
}

impl ServerConfig {
    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl TicketConfig {
    /// Parses the fleet contract address.
    pub fn fleet_address(&self) -> Result<Address, ConfigError> {
        self.fleet_contract
            .parse()
            .map_err(|_| ConfigError::InvalidFleetContract(self.fleet_contract.clone()))
    }
}

impl BindConfig {
    /// Parses the remote device address.
    pub fn device_address(&self) -> Result<Address, ConfigError> {
        self.device
            .parse()
            .map_err(|_| ConfigError::InvalidDeviceId(self.device.clone()))
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("diode-tunnel")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - DIODE_HOST: Override relay host
    /// - DIODE_PORT: Override relay port
    /// - DIODE_CERT: Override certificate path
    /// - DIODE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Some(host) = non_empty_var("DIODE_HOST") {
            tracing::info!("Overriding server host from environment: {}", host);
            self.server.host = host;
        }

        if let Some(port) = non_empty_var("DIODE_PORT") {
            match port.parse() {
                Ok(port) => {
                    tracing::info!("Overriding server port from environment: {}", port);
                    self.server.port = port;
                }
                Err(_) => tracing::warn!("Ignoring invalid DIODE_PORT value: {}", port),
            }
        }

        if let Some(cert) = non_empty_var("DIODE_CERT") {
            tracing::info!("Overriding cert_path from environment: {}", cert);
            self.identity.cert_path = PathBuf::from(cert);
        }

        if let Some(level) = non_empty_var("DIODE_LOG_LEVEL") {
            tracing::info!("Overriding log level from environment: {}", level);
            self.log.level = level;
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.server.port == 0 {
            return Err(ConfigError::InvalidServerPort);
        }
        if self.server.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("connect_timeout_secs"));
        }
        if self.server.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("request_timeout_secs"));
        }

        self.ticket.fleet_address()?;

        for bind in &self.bind {
            if bind.local_port == 0 {
                return Err(ConfigError::InvalidBindPort);
            }
            bind.device_address()?;
        }

        if self.publish.ports.contains(&0) {
            return Err(ConfigError::InvalidPublishPort);
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        Ok(())
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
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
