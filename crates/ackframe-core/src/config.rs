//! Configuration types for ackframe servers and clients.
//!
//! Configuration is loaded from YAML files and validated before use.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Root configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AckframeConfig {
    /// Server side settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Client side settings.
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A single address the server listens on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ListenAddress {
    /// IPv4 address to bind.
    /// Supports environment variable expansion: "${ACKFRAME_LISTEN_IP}"
    pub ip: String,

    /// TCP port, 1-65535.
    pub port: u16,
}

impl ListenAddress {
    /// Create a listen address without validating it.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Validate and resolve into a socket address.
    ///
    /// # Errors
    ///
    /// Returns an error if the port is zero or the IP is not a valid IPv4 address.
    pub fn to_socket_addr(&self) -> ConfigResult<SocketAddrV4> {
        validate_port(self.port)?;
        let ip = parse_ipv4(&expand_env_vars(&self.ip))?;
        Ok(SocketAddrV4::new(ip, self.port))
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Addresses to listen on.
    #[serde(default)]
    pub listen: Vec<ListenAddress>,

    /// Maximum number of concurrent connections. Unset means unlimited.
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// Upper bound on each accept and connection loop wait, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long to wait for connection tasks to exit on shutdown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// Client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound on each connection loop wait, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long to wait for connection tasks to exit on shutdown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

// Default value functions

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_shutdown_grace_ms() -> u64 {
    2_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            max_connections: None,
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl ServerConfig {
    /// Validate the server configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any listen address is invalid, the poll interval
    /// is zero, or the connection limit is zero.
    pub fn validate(&self) -> ConfigResult<()> {
        for address in &self.listen {
            address.to_socket_addr()?;
        }
        if self.max_connections == Some(0) {
            return Err(ConfigError::InvalidConnectionLimit);
        }
        validate_poll_interval(self.poll_interval_ms)
    }

    /// Poll interval as a duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Shutdown grace period as a duration.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl ClientConfig {
    /// Validate the client configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the poll interval is zero.
    pub fn validate(&self) -> ConfigResult<()> {
        validate_poll_interval(self.poll_interval_ms)
    }

    /// Connect timeout as a duration.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Poll interval as a duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Shutdown grace period as a duration.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// Configuration loading and validation

impl AckframeConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        self.server.validate()?;
        self.client.validate()
    }
}

/// Check that a port is usable for listening or connecting.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidPort`] for port 0.
pub fn validate_port(port: u16) -> ConfigResult<()> {
    if port == 0 {
        return Err(ConfigError::InvalidPort(port));
    }
    Ok(())
}

/// Parse a dotted-quad IPv4 address.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidAddress`] if the string is not IPv4.
pub fn parse_ipv4(ip: &str) -> ConfigResult<Ipv4Addr> {
    ip.parse()
        .map_err(|_| ConfigError::InvalidAddress(ip.to_string()))
}

fn validate_poll_interval(ms: u64) -> ConfigResult<()> {
    if ms == 0 {
        return Err(ConfigError::InvalidPollInterval(ms));
    }
    Ok(())
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}
