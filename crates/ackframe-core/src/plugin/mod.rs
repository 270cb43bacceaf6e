//! Payload transform pipeline.
//!
//! Plugins registered on a connection as `[P1, P2, ..., Pn]` are applied
//! forward on the way out and in reverse on the way in:
//!
//! ```text
//! outbound: msg |> P1.transmit |> P2.transmit |> ... |> Pn.transmit  -> wire
//! inbound:  wire |> Pn.receive |> ... |> P2.receive |> P1.receive    -> handler
//! ```
//!
//! The length prefix is computed after the whole outbound chain and decoded
//! before the inbound chain runs, so plugins may change payload sizes.

mod deflate;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::PluginError;

pub use deflate::DeflatePlugin;

/// Result type alias for plugin transforms.
pub type PluginResult = std::result::Result<Bytes, PluginError>;

/// A symmetric payload transform.
///
/// Both directions default to identity. Implementations are shared across
/// every task that may call `transmit` on a connection, so any interior state
/// must be synchronized by the plugin itself.
pub trait Plugin: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Transform an outbound payload.
    fn transmit(&self, msg: Bytes) -> PluginResult {
        Ok(msg)
    }

    /// Undo the outbound transform on an inbound payload.
    fn receive(&self, msg: Bytes) -> PluginResult {
        Ok(msg)
    }
}

/// Ordered list of plugins attached to a connection.
#[derive(Clone, Default)]
pub struct PluginChain {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin; it runs last outbound and first inbound.
    pub fn push(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// Number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Plugin names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.iter().map(|p| p.name())
    }

    /// Run the chain in registration order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first plugin failure.
    pub fn apply_outbound(&self, msg: Bytes) -> PluginResult {
        self.plugins.iter().try_fold(msg, |msg, plugin| plugin.transmit(msg))
    }

    /// Run the chain in reverse registration order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first plugin failure.
    pub fn apply_inbound(&self, msg: Bytes) -> PluginResult {
        self.plugins
            .iter()
            .rev()
            .try_fold(msg, |msg, plugin| plugin.receive(msg))
    }
}

impl fmt::Debug for PluginChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
