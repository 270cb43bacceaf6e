//! Domain error types for the ackframe protocol stack.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use thiserror::Error;

use crate::wire::ControlCode;

/// Errors related to configuration parsing and validation.
///
/// These are raised synchronously at registration time, before any socket
/// or task is created.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Port outside the `1..=65535` range.
    #[error("invalid port {0}: must be between 1 and 65535")]
    InvalidPort(u16),

    /// Address string that does not parse as IPv4.
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),

    /// Poll interval must be non-zero so loops stay responsive.
    #[error("poll_interval_ms must be at least 1, got {0}")]
    InvalidPollInterval(u64),

    /// A connection limit of zero would reject every peer.
    #[error("max_connections must be at least 1 when set")]
    InvalidConnectionLimit,

    /// Server started without any address to listen on.
    #[error("no listen address configured")]
    NoListenAddress,

    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

/// Violations of the framing or handshake protocol.
///
/// A protocol error terminates the connection it occurred on and nothing else.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload length exceeds the frame ceiling.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: u64, max: u32 },

    /// Peer answered the handshake with a control code other than `Ok`.
    #[error("handshake rejected by peer: {0}")]
    HandshakeRejected(ControlCode),

    /// Peer acknowledged a length header with something other than `Ok`.
    #[error("message rejected by peer: {0}")]
    Rejected(ControlCode),

    /// Byte read where a control code was expected is not a known code.
    #[error("unknown control byte 0x{0:02x}")]
    UnknownControlByte(u8),
}

/// A plugin failed to transform a payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("plugin '{plugin}' failed: {message}")]
pub struct PluginError {
    /// Name of the failing plugin.
    pub plugin: String,
    /// Human readable failure description.
    pub message: String,
}

impl PluginError {
    /// Create a new plugin error.
    pub fn new(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

/// Errors that occur while running servers, clients and connections.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// TCP/IO error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Protocol violation.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Plugin transform failure.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// Failed to bind a listening socket.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Host name did not resolve to any IPv4 address.
    #[error("could not resolve '{host}' to an IPv4 address")]
    Resolve { host: String },

    /// Outbound connect did not complete in time.
    #[error("connect to {address} timed out after {timeout_ms}ms")]
    ConnectTimeout { address: String, timeout_ms: u64 },

    /// Operation attempted on a connection that has already shut down.
    #[error("connection is shut down")]
    Closed,
}

/// Result type alias for network operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for wire-level operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
