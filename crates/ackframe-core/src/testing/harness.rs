//! Test harness for integration testing of servers and clients.
//!
//! Provides a running server on a loopback port with:
//! - A [`Recording`] of everything its connections received
//! - [`RecordingHooks`] tracking connection init and shutdown
//! - Helpers for opening clients and raw peers against it

use std::future::Future;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::time::{Duration, Instant};

use crate::network::{Client, ConnectionHandler, ConnectionLimit, Server, ServerHandle};
use crate::plugin::DeflatePlugin;

use super::handlers::{Recording, RecordingHandler, RecordingHooks};
use super::raw_peer::RawPeer;

/// Poll interval used by harness servers and clients.
pub const TEST_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Reserve a loopback port that is free at the time of the call.
pub fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("Failed to bind probe listener");
    listener
        .local_addr()
        .expect("Failed to read probe address")
        .port()
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}

/// Await `fut`, failing the test if it does not complete within `timeout`.
pub async fn within<F: Future>(timeout: Duration, fut: F) -> F::Output {
    tokio::time::timeout(timeout, fut)
        .await
        .expect("operation did not complete in time")
}

/// A running server wired to recording handlers and hooks.
pub struct ServerHarness {
    /// Control handle of the running server.
    pub handle: ServerHandle,
    /// Messages and hook calls observed by server connections.
    pub recording: Recording,
    /// Lifecycle notifications fired by the server.
    pub hooks: RecordingHooks,
    addr: SocketAddr,
    deflate: bool,
}

impl ServerHarness {
    /// Start a recording server with default settings.
    pub async fn new() -> Self {
        HarnessBuilder::new().build().await
    }

    /// Server listen address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// A client configured to match the server's plugins.
    #[must_use]
    pub fn client(&self) -> Client {
        let mut client = test_client();
        if self.deflate {
            client.register_connection_plugin(DeflatePlugin::new(64));
        }
        client
    }

    /// Open a raw protocol peer against the server.
    pub async fn raw_peer(&self) -> RawPeer {
        RawPeer::connect(self.addr)
            .await
            .expect("Failed to connect raw peer")
    }

    /// Shut the server down and wait for it to drain.
    pub async fn shutdown(self) {
        within(Duration::from_secs(5), self.handle.shutdown_and_wait()).await;
    }
}

/// A client using the harness poll interval.
#[must_use]
pub fn test_client() -> Client {
    let config = crate::config::ClientConfig {
        poll_interval_ms: 5,
        shutdown_grace_ms: 1_000,
        ..Default::default()
    };
    Client::new(config).expect("valid test client config")
}

/// Builder for custom harness configurations.
#[derive(Debug, Default)]
pub struct HarnessBuilder {
    limit: ConnectionLimit,
    echo: bool,
    deflate: bool,
}

impl HarnessBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn connection_limit(mut self, max: usize) -> Self {
        self.limit = ConnectionLimit::Max(max);
        self
    }

    /// Echo every received message back to its sender.
    #[must_use]
    pub fn echo(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Compress payloads with [`DeflatePlugin`] on server connections.
    #[must_use]
    pub fn deflate(mut self) -> Self {
        self.deflate = true;
        self
    }

    pub async fn build(self) -> ServerHarness {
        let recording = Recording::new();
        let hooks = RecordingHooks::new();

        let mut server = Server::new();
        server
            .add_listen_address("127.0.0.1", free_port())
            .expect("valid loopback address");
        server
            .set_poll_interval(TEST_POLL_INTERVAL)
            .expect("non-zero poll interval");
        server.set_shutdown_grace(Duration::from_secs(1));
        server.set_connection_limit(self.limit);
        server.set_lifecycle_hooks(hooks.clone());
        if self.deflate {
            server.register_connection_plugin(DeflatePlugin::new(64));
        }

        let echo = self.echo;
        let factory_recording = recording.clone();
        server.set_connection_handler(move || -> Box<dyn ConnectionHandler> {
            let handler = RecordingHandler::new(factory_recording.clone());
            Box::new(if echo { handler.echoing() } else { handler })
        });

        let handle = server.start().await.expect("Failed to start test server");
        let addr = handle.local_addrs()[0];

        ServerHarness {
            handle,
            recording,
            hooks,
            addr,
            deflate: self.deflate,
        }
    }
}
