//! TCP server accepting ackframe connections.
//!
//! The server binds every configured address, then runs an accept loop that
//! admits peers up to the connection limit and spawns a task for each one.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{parse_ipv4, validate_port, ServerConfig};
use crate::error::{ConfigError, ConfigResult, NetworkError, Result};
use crate::plugin::{Plugin, PluginChain};
use crate::wire::ControlCode;

use super::connection::{Connection, ConnectionId};
use super::hooks::{noop_factory, ConnectionHandler, HandlerFactory, LifecycleHooks, NoopHooks};
use super::registry::Registry;

/// Admission policy for new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionLimit {
    #[default]
    Unlimited,
    Max(usize),
}

impl ConnectionLimit {
    /// Whether a new peer may join when `current` connections are registered.
    #[must_use]
    pub fn admits(self, current: usize) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Max(max) => current < max,
        }
    }
}

impl From<Option<usize>> for ConnectionLimit {
    fn from(max: Option<usize>) -> Self {
        max.map_or(Self::Unlimited, Self::Max)
    }
}

/// Server builder. Consumed by [`Server::start`].
pub struct Server {
    listen: Vec<SocketAddrV4>,
    handler_factory: HandlerFactory,
    limit: ConnectionLimit,
    plugins: PluginChain,
    hooks: Arc<dyn LifecycleHooks>,
    poll_interval: Duration,
    shutdown_grace: Duration,
}

impl Default for Server {
    fn default() -> Self {
        let config = ServerConfig::default();
        Self {
            listen: Vec::new(),
            handler_factory: noop_factory(),
            limit: ConnectionLimit::Unlimited,
            plugins: PluginChain::new(),
            hooks: Arc::new(NoopHooks),
            poll_interval: config.poll_interval(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

impl Server {
    /// Create a server with no listen addresses and default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a server from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration fails validation.
    pub fn from_config(config: &ServerConfig) -> ConfigResult<Self> {
        config.validate()?;

        let mut server = Self {
            limit: config.max_connections.into(),
            poll_interval: config.poll_interval(),
            shutdown_grace: config.shutdown_grace(),
            ..Self::default()
        };
        for address in &config.listen {
            server.listen.push(address.to_socket_addr()?);
        }
        Ok(server)
    }

    /// Add an IPv4 address to listen on.
    ///
    /// # Errors
    ///
    /// Returns an error if the port is 0 or `ip` is not a valid IPv4 address.
    pub fn add_listen_address(&mut self, ip: &str, port: u16) -> ConfigResult<()> {
        validate_port(port)?;
        let ip = parse_ipv4(ip)?;
        self.listen.push(SocketAddrV4::new(ip, port));
        Ok(())
    }

    /// Set the factory producing a handler for each accepted connection.
    pub fn set_connection_handler<F>(&mut self, factory: F)
    where
        F: Fn() -> Box<dyn ConnectionHandler> + Send + Sync + 'static,
    {
        self.handler_factory = Arc::new(factory);
    }

    pub fn set_connection_limit(&mut self, limit: ConnectionLimit) {
        self.limit = limit;
    }

    /// Add a plugin to every connection accepted from now on.
    pub fn register_connection_plugin(&mut self, plugin: impl Plugin + 'static) {
        self.plugins.push(Arc::new(plugin));
    }

    /// Add a default-constructed plugin of type `P` to future connections.
    pub fn register_connection_plugin_type<P: Plugin + Default + 'static>(&mut self) {
        self.register_connection_plugin(P::default());
    }

    pub fn set_lifecycle_hooks(&mut self, hooks: impl LifecycleHooks + 'static) {
        self.hooks = Arc::new(hooks);
    }

    /// Bound on each accept and connection loop wait.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero interval.
    pub fn set_poll_interval(&mut self, interval: Duration) -> ConfigResult<()> {
        if interval.is_zero() {
            return Err(ConfigError::InvalidPollInterval(0));
        }
        self.poll_interval = interval;
        Ok(())
    }

    pub fn set_shutdown_grace(&mut self, grace: Duration) {
        self.shutdown_grace = grace;
    }

    /// Bind every listen address and spawn the accept loop.
    ///
    /// Binding is all or nothing: if any address fails, listeners bound so
    /// far are dropped before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if no address was configured or any bind fails.
    #[instrument(skip(self), fields(addresses = self.listen.len()))]
    pub async fn start(self) -> Result<ServerHandle> {
        if self.listen.is_empty() {
            return Err(ConfigError::NoListenAddress.into());
        }

        let mut listeners = Vec::with_capacity(self.listen.len());
        for address in &self.listen {
            let listener = TcpListener::bind(*address)
                .await
                .map_err(|source| NetworkError::Bind {
                    address: address.to_string(),
                    source,
                })?;
            listeners.push(listener);
        }

        let local_addrs = listeners
            .iter()
            .map(TcpListener::local_addr)
            .collect::<io::Result<Vec<_>>>()?;
        for addr in &local_addrs {
            info!(address = %addr, "server listening");
        }

        let shutdown = CancellationToken::new();
        let registry = Arc::new(Registry::new());

        let accept_loop = AcceptLoop {
            listeners,
            registry: Arc::clone(&registry),
            shutdown: shutdown.clone(),
            handler_factory: self.handler_factory,
            limit: self.limit,
            plugins: self.plugins,
            hooks: self.hooks,
            poll_interval: self.poll_interval,
            shutdown_grace: self.shutdown_grace,
        };
        let task = tokio::spawn(accept_loop.run());

        Ok(ServerHandle {
            shutdown,
            registry,
            local_addrs,
            task,
        })
    }
}

/// State owned by the accept loop task.
struct AcceptLoop {
    listeners: Vec<TcpListener>,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
    handler_factory: HandlerFactory,
    limit: ConnectionLimit,
    plugins: PluginChain,
    hooks: Arc<dyn LifecycleHooks>,
    poll_interval: Duration,
    shutdown_grace: Duration,
}

impl AcceptLoop {
    async fn run(self) {
        loop {
            self.registry.reap(&*self.hooks);

            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("shutdown signal received");
                    break;
                }
                result = tokio::time::timeout(self.poll_interval, accept_any(&self.listeners)) => result,
            };

            match accepted {
                Ok(Ok((stream, peer))) => self.admit(stream, peer).await,
                Ok(Err(e)) => error!(error = %e, "accept error"),
                Err(_elapsed) => {}
            }
        }

        self.registry.shutdown_all();
        let Self {
            listeners,
            registry,
            hooks,
            shutdown_grace,
            ..
        } = self;
        drop(listeners);

        let active = registry.len();
        if active > 0 {
            info!(active, "waiting for connections to close");
            registry.drain(shutdown_grace).await;
        }
        let reaped = registry.reap(&*hooks);
        info!(reaped, "server stopped");
    }

    async fn admit(&self, mut stream: TcpStream, peer: SocketAddr) {
        let current = self.registry.len();
        if !self.limit.admits(current) {
            warn!(peer = %peer, active = current, limit = ?self.limit, "connection rejected: limit reached");
            reject(&mut stream, ControlCode::ConnLimit).await;
            return;
        }

        let id = self.registry.fresh_id();
        let mut conn = match Connection::new(
            id.clone(),
            stream,
            self.shutdown.child_token(),
            self.poll_interval,
        ) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed to set up connection");
                return;
            }
        };
        conn.set_plugins(self.plugins.clone());
        self.hooks.conn_init(&id, &conn);

        let conn = Arc::new(conn);
        let handler = (self.handler_factory)();
        let task = tokio::spawn(Arc::clone(&conn).run(handler));
        self.registry.insert(id.clone(), conn, task);

        debug!(peer = %peer, %id, active = current + 1, "accepted connection");
    }
}

/// Wait for the first listener to accept.
async fn accept_any(listeners: &[TcpListener]) -> io::Result<(TcpStream, SocketAddr)> {
    let accepts = listeners.iter().map(|l| Box::pin(l.accept()));
    let (result, _, _) = futures::future::select_all(accepts).await;
    result
}

async fn reject(stream: &mut TcpStream, code: ControlCode) {
    let sent = async {
        stream.write_all(&[code.as_byte()]).await?;
        stream.shutdown().await
    };
    if let Err(e) = sent.await {
        debug!(error = %e, "failed to deliver rejection");
    }
}

/// Control handle for a running server.
#[derive(Debug)]
pub struct ServerHandle {
    shutdown: CancellationToken,
    registry: Arc<Registry>,
    local_addrs: Vec<SocketAddr>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Signal the accept loop and every connection to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Addresses the server is bound to, in listen order.
    #[must_use]
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.registry.ids()
    }

    #[must_use]
    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.registry.get(id)
    }

    /// Wait for the accept loop to finish draining after shutdown.
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            error!(error = %e, "accept loop task failed");
        }
    }

    /// Signal shutdown and wait for the server to drain.
    pub async fn shutdown_and_wait(self) {
        self.shutdown();
        self.wait().await;
    }
}
