//! Outbound connection owner.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::{validate_port, ClientConfig};
use crate::error::{ConfigResult, NetworkError, Result};
use crate::plugin::{Plugin, PluginChain};

use super::connection::{Connection, ConnectionId};
use super::hooks::{noop_factory, ConnectionHandler, HandlerFactory, LifecycleHooks, NoopHooks};
use super::registry::Registry;

/// Opens connections to servers and owns their tasks.
///
/// Dropping the client signals every connection to shut down; call
/// [`Client::shutdown`] to also wait for them to finish.
pub struct Client {
    config: ClientConfig,
    handler_factory: HandlerFactory,
    plugins: PluginChain,
    hooks: Arc<dyn LifecycleHooks>,
    registry: Registry,
    shutdown: CancellationToken,
}

impl Default for Client {
    fn default() -> Self {
        Self::with_validated(ClientConfig::default())
    }
}

impl Client {
    /// Create a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration fails validation.
    pub fn new(config: ClientConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::with_validated(config))
    }

    fn with_validated(config: ClientConfig) -> Self {
        Self {
            config,
            handler_factory: noop_factory(),
            plugins: PluginChain::new(),
            hooks: Arc::new(NoopHooks),
            registry: Registry::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn set_connection_handler<F>(&mut self, factory: F)
    where
        F: Fn() -> Box<dyn ConnectionHandler> + Send + Sync + 'static,
    {
        self.handler_factory = Arc::new(factory);
    }

    /// Add a plugin to every connection opened from now on.
    pub fn register_connection_plugin(&mut self, plugin: impl Plugin + 'static) {
        self.plugins.push(Arc::new(plugin));
    }

    pub fn register_connection_plugin_type<P: Plugin + Default + 'static>(&mut self) {
        self.register_connection_plugin(P::default());
    }

    pub fn set_lifecycle_hooks(&mut self, hooks: impl LifecycleHooks + 'static) {
        self.hooks = Arc::new(hooks);
    }

    /// Connect to `host:port` and spawn the connection task.
    ///
    /// Returns once the TCP connection is open; the protocol handshake runs
    /// inside the task. Use [`Connection::wait_established`] to observe it.
    ///
    /// # Errors
    ///
    /// Returns an error if the port is invalid, the host does not resolve to
    /// an IPv4 address, the connect fails or times out, or the client has
    /// been shut down.
    #[instrument(skip(self))]
    pub async fn connect_to(&mut self, host: &str, port: u16) -> Result<ConnectionId> {
        if self.shutdown.is_cancelled() {
            return Err(NetworkError::Closed);
        }
        validate_port(port)?;

        let address = resolve_ipv4(host, port).await?;
        let timeout = self.config.connect_timeout();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| NetworkError::ConnectTimeout {
                address: address.to_string(),
                timeout_ms: duration_ms(timeout),
            })??;

        let id = self.registry.fresh_id();
        let mut conn = Connection::new(
            id.clone(),
            stream,
            self.shutdown.child_token(),
            self.config.poll_interval(),
        )?;
        conn.set_plugins(self.plugins.clone());
        self.hooks.conn_init(&id, &conn);

        let conn = Arc::new(conn);
        let handler = (self.handler_factory)();
        let task = tokio::spawn(Arc::clone(&conn).run(handler));
        self.registry.insert(id.clone(), conn, task);

        info!(%id, %address, "connected");
        Ok(id)
    }

    #[must_use]
    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.registry.get(id)
    }

    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.registry.ids()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Remove finished connections, firing `conn_shutdown` for each.
    pub fn reap(&mut self) -> usize {
        self.registry.reap(&*self.hooks)
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Shut every connection down and wait up to the grace period for them.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        self.registry.shutdown_all();
        self.registry.drain(self.config.shutdown_grace()).await;
        let reaped = self.reap();
        debug!(reaped, "client shut down");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddr> {
    let unresolved = || NetworkError::Resolve {
        host: host.to_string(),
    };
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| unresolved())?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(unresolved)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    #[tokio::test]
    async fn test_connect_rejects_port_zero() {
        let mut client = Client::default();
        let result = client.connect_to("127.0.0.1", 0).await;
        assert!(matches!(
            result,
            Err(NetworkError::Config(ConfigError::InvalidPort(0)))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let mut client = Client::default();
        let result = client.connect_to("127.0.0.1", port).await;
        assert!(matches!(result, Err(NetworkError::Io(_))));
        assert_eq!(client.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_ipv4_only() {
        assert!(resolve_ipv4("127.0.0.1", 80).await.unwrap().is_ipv4());
        assert!(matches!(
            resolve_ipv4("::1", 80).await,
            Err(NetworkError::Resolve { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_after_shutdown_fails() {
        let mut client = Client::default();
        client.shutdown().await;
        assert!(client.is_shutdown());
        assert!(matches!(
            client.connect_to("127.0.0.1", 7000).await,
            Err(NetworkError::Closed)
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClientConfig {
            poll_interval_ms: 0,
            ..ClientConfig::default()
        };
        assert!(Client::new(config).is_err());
    }
}
