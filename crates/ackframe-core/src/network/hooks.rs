//! Extension points for connection behavior.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::connection::{Connection, ConnectionId};

/// Per-connection behavior, driven by the connection task.
///
/// Every hook defaults to a no-op. The handler is owned by a single task, so
/// hooks take `&mut self` and need no synchronization of their own.
#[async_trait]
pub trait ConnectionHandler: Send {
    /// Runs once after a successful handshake, before the first loop pass.
    async fn pre_loop(&mut self, _conn: &Connection) {}

    /// Runs once after the loop ends, before the socket is closed.
    async fn post_loop(&mut self, _conn: &Connection) {}

    /// Runs at the end of every loop iteration, whether or not a message arrived.
    async fn loop_pass(&mut self, _conn: &Connection) {}

    /// Runs for every message received by the connection loop.
    async fn on_message(&mut self, _conn: &Connection, _payload: Bytes) {}
}

/// Handler with every hook left at its default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ConnectionHandler for NoopHandler {}

/// Factory producing a fresh handler for every new connection.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn ConnectionHandler> + Send + Sync>;

pub(crate) fn noop_factory() -> HandlerFactory {
    Arc::new(|| Box::new(NoopHandler))
}

/// Notifications fired by the connection owner as connections come and go.
///
/// `conn_init` runs before the connection task is spawned. `conn_shutdown`
/// runs when a finished connection is reaped from the registry.
pub trait LifecycleHooks: Send + Sync {
    fn conn_init(&self, _id: &ConnectionId, _conn: &Connection) {}

    fn conn_shutdown(&self, _id: &ConnectionId, _conn: &Connection) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {}
