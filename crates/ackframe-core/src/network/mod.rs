//! Network layer for the ackframe protocol.
//!
//! This module provides:
//! - [`Connection`]: one framed, acknowledged TCP connection and its task loop
//! - [`Server`]: listeners, admission control and the accept loop
//! - [`Client`]: outbound connections
//! - [`ConnectionHandler`] / [`LifecycleHooks`]: user extension points

pub mod client;
pub mod connection;
pub mod hooks;
pub mod registry;
pub mod server;

pub use client::Client;
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use hooks::{ConnectionHandler, HandlerFactory, LifecycleHooks, NoopHandler, NoopHooks};
pub use registry::Registry;
pub use server::{ConnectionLimit, Server, ServerHandle};
