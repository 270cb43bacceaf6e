//! Ackframe Core Library
//!
//! A minimal TCP messaging protocol: every message carries a 4-byte
//! big-endian length prefix, the receiver acknowledges the header with a
//! single control byte, and only then does the payload follow. Payloads pass
//! through an ordered chain of transform plugins on both sides.
//!
//! # Architecture
//!
//! - [`wire`] - Length prefix codec and control codes
//! - [`plugin`] - Payload transform pipeline
//! - [`network`] - Connections, server accept loop and client
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//!
//! # Example
//!
//! ```rust,ignore
//! use ackframe_core::{Client, Server};
//!
//! let mut server = Server::new();
//! server.add_listen_address("127.0.0.1", 7100)?;
//! let handle = server.start().await?;
//!
//! let mut client = Client::default();
//! let id = client.connect_to("127.0.0.1", 7100).await?;
//! let conn = client.connection(&id).unwrap();
//! conn.wait_established().await?;
//! conn.transmit("hello").await?;
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod network;
pub mod plugin;
pub mod wire;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use config::{AckframeConfig, ClientConfig, ListenAddress, LoggingConfig, ServerConfig};
pub use error::{ConfigError, NetworkError, PluginError, ProtocolError, Result};
pub use network::{
    Client, Connection, ConnectionHandler, ConnectionId, ConnectionLimit, ConnectionState,
    LifecycleHooks, Server, ServerHandle,
};
pub use plugin::{DeflatePlugin, Plugin, PluginChain};
pub use wire::{ControlCode, MSG_MAX_SIZE};
