//! A single framed, acknowledged TCP connection.
//!
//! Each message on the wire is a three-step exchange:
//!
//! 1. the sender writes the 4-byte length header;
//! 2. the receiver answers with one control byte (`0xFF` to accept);
//! 3. on acceptance the sender writes the payload.
//!
//! One exchange lock per connection keeps these steps from interleaving with
//! another exchange on the same socket. The protocol is half-duplex: two peers
//! transmitting at the same moment each read the other's length header where
//! they expect an ack, and both fail with a protocol error.

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use rand::Rng;
use socket2::SockRef;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::error::{NetworkError, ProtocolError, Result};
use crate::plugin::{Plugin, PluginChain};
use crate::wire::{ControlCode, FrameHeader, HEADER_SIZE};

use super::hooks::ConnectionHandler;

/// Registry key for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn-{:016x}", rand::thread_rng().gen::<u64>()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle of a connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Built but the task has not started.
    Created,
    /// Handshake bytes in flight.
    Handshaking,
    /// Handshake succeeded; the receive loop is active.
    Running,
    /// Loop ended; running `post_loop` and closing.
    ShuttingDown,
    /// Socket closed. Terminal: also set when an owner aborts a task that
    /// outlived the shutdown grace period.
    Closed,
}

impl ConnectionState {
    fn is_settled(self) -> bool {
        !matches!(self, Self::Created | Self::Handshaking)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Handshaking => "handshaking",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One peer connection.
///
/// Plugins are registered through `&mut self` before the connection is
/// wrapped in an [`Arc`] and handed to its task, after which the chain is
/// read-only.
pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    plugins: PluginChain,
    exchange: Mutex<()>,
    shutdown: CancellationToken,
    state: watch::Sender<ConnectionState>,
    handshake_done: AtomicBool,
    handshake_error: OnceLock<ProtocolError>,
    poll_interval: Duration,
    closed: AtomicBool,
}

impl Connection {
    /// Wrap a connected stream.
    ///
    /// `shutdown` is the connection's own signal; owners pass a child of
    /// their token so shutting the owner down reaches every connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer address cannot be read or socket options
    /// cannot be applied.
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        shutdown: CancellationToken,
        poll_interval: Duration,
    ) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (state, _) = watch::channel(ConnectionState::Created);

        Ok(Self {
            id,
            stream,
            peer_addr,
            plugins: PluginChain::new(),
            exchange: Mutex::new(()),
            shutdown,
            state,
            handshake_done: AtomicBool::new(false),
            handshake_error: OnceLock::new(),
            poll_interval,
            closed: AtomicBool::new(false),
        })
    }

    /// Append a plugin instance to the chain.
    pub fn register_plugin(&mut self, plugin: impl Plugin + 'static) {
        self.plugins.push(Arc::new(plugin));
    }

    /// Append a default-constructed plugin of type `P`.
    pub fn register_plugin_type<P: Plugin + Default + 'static>(&mut self) {
        self.register_plugin(P::default());
    }

    pub(crate) fn set_plugins(&mut self, plugins: PluginChain) {
        self.plugins = plugins;
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Whether shutdown has been signalled. Once true it stays true.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Signal the connection to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait until the handshake outcome is known.
    ///
    /// # Errors
    ///
    /// Returns the handshake protocol error if the peer rejected us, or
    /// [`NetworkError::Closed`] if the connection ended before completing it.
    pub async fn wait_established(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this only returns once settled.
        let _ = rx.wait_for(|state| state.is_settled()).await;

        if self.completed_handshake() {
            Ok(())
        } else if let Some(err) = self.handshake_error.get() {
            Err(err.clone().into())
        } else {
            Err(NetworkError::Closed)
        }
    }

    fn completed_handshake(&self) -> bool {
        self.handshake_done.load(Ordering::Acquire)
    }

    /// Gate for exchanges: resolves once the handshake succeeded.
    async fn ready(&self) -> Result<()> {
        if self.completed_handshake() {
            return Ok(());
        }
        tokio::select! {
            () = self.shutdown.cancelled() => Err(NetworkError::Closed),
            established = self.wait_established() => {
                established.map_err(|_| NetworkError::Closed)
            }
        }
    }

    /// Send one message to the peer.
    ///
    /// Waits for the handshake to finish before touching the socket, so it is
    /// safe to call straight after the connection is spawned.
    ///
    /// Transport faults shut the connection down and still return `Ok(())`;
    /// callers poll [`Connection::is_shutdown`] to detect them.
    ///
    /// # Errors
    ///
    /// - [`NetworkError::Closed`] if the connection is shut down or its handshake failed
    /// - [`NetworkError::Plugin`] if an outbound plugin fails
    /// - [`ProtocolError::FrameTooLarge`] if the transformed payload exceeds the ceiling
    /// - [`ProtocolError::Rejected`] or [`ProtocolError::UnknownControlByte`]
    ///   if the peer does not acknowledge the header; the connection is shut down
    pub async fn transmit(&self, payload: impl Into<Bytes>) -> Result<()> {
        if self.is_shutdown() {
            return Err(NetworkError::Closed);
        }
        self.ready().await?;

        let wire = self.plugins.apply_outbound(payload.into())?;
        let header = FrameHeader::new(wire.len())?.to_bytes()?;

        let _guard = self.exchange.lock().await;

        if let Err(e) = self.write_all(&header).await {
            self.fault("writing header", &e);
            return Ok(());
        }

        let mut ack = [0u8; 1];
        if let Err(e) = self.read_exact(&mut ack).await {
            self.fault("reading ack", &e);
            return Ok(());
        }

        match ControlCode::from_byte(ack[0]) {
            Ok(ControlCode::Ok) => {}
            Ok(code) => {
                warn!(connection = %self.id, %code, "message rejected by peer");
                self.shutdown();
                return Err(ProtocolError::Rejected(code).into());
            }
            Err(e) => {
                warn!(connection = %self.id, error = %e, "invalid ack");
                self.shutdown();
                return Err(e.into());
            }
        }

        if let Err(e) = self.write_all(&wire).await {
            self.fault("writing payload", &e);
            return Ok(());
        }

        trace!(connection = %self.id, len = wire.len(), "message sent");
        Ok(())
    }

    /// Wait for and return the next message from the peer.
    ///
    /// Waits for the handshake first, like [`Connection::transmit`]. Holds the exchange lock until a header arrives, so a concurrent
    /// `transmit` on the same connection waits behind it. Returns `None` when
    /// the peer closed, the message was oversized, or an inbound plugin
    /// failed. Only the first and a transport fault shut the connection down.
    pub async fn receive(&self) -> Option<Bytes> {
        if self.is_shutdown() || self.ready().await.is_err() {
            return None;
        }
        let _guard = self.exchange.lock().await;
        self.receive_exchange().await
    }

    /// Receive path used by the connection loop.
    ///
    /// The readiness that woke the loop may have belonged to an ack consumed
    /// by a concurrent `transmit`; only start an exchange if bytes are still
    /// pending once the lock is held.
    async fn receive_pending(&self) -> Option<Bytes> {
        let _guard = self.exchange.lock().await;
        if self.is_shutdown() {
            return None;
        }

        let mut probe = [0u8; 1];
        match self.stream.peek(&mut probe).now_or_never() {
            None => None,
            Some(Ok(0)) => {
                debug!(connection = %self.id, "peer closed connection");
                self.shutdown();
                None
            }
            Some(Ok(_)) => self.receive_exchange().await,
            Some(Err(e)) => {
                self.fault("peeking socket", &e);
                None
            }
        }
    }

    /// One inbound exchange. Caller holds the exchange lock.
    async fn receive_exchange(&self) -> Option<Bytes> {
        let mut header = [0u8; HEADER_SIZE];
        if let Err(e) = self.read_exact(&mut header).await {
            self.fault("reading header", &e);
            return None;
        }
        let header = FrameHeader::from_bytes(header);

        if !header.is_within_limit() {
            warn!(
                connection = %self.id,
                length = header.length(),
                "rejecting oversized message"
            );
            if let Err(e) = self.write_all(&[ControlCode::GenericError.as_byte()]).await {
                self.fault("writing rejection", &e);
            }
            return None;
        }

        if let Err(e) = self.write_all(&[ControlCode::Ok.as_byte()]).await {
            self.fault("writing ack", &e);
            return None;
        }

        let mut payload = vec![0u8; header.length() as usize];
        if let Err(e) = self.read_exact(&mut payload).await {
            self.fault("reading payload", &e);
            return None;
        }
        trace!(connection = %self.id, len = payload.len(), "message received");

        match self.plugins.apply_inbound(Bytes::from(payload)) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!(connection = %self.id, error = %e, "dropping message");
                None
            }
        }
    }

    /// Connection task entry point.
    ///
    /// Performs the handshake, runs the receive loop until shutdown and
    /// closes the socket. A rejected handshake skips `pre_loop` / `post_loop`.
    pub async fn run(self: Arc<Self>, mut handler: Box<dyn ConnectionHandler>) {
        let span = info_span!("connection", id = %self.id, peer = %self.peer_addr);

        async move {
            if !self.handshake().await {
                self.close();
                self.set_state(ConnectionState::Closed);
                return;
            }

            handler.pre_loop(&self).await;

            while !self.is_shutdown() {
                tokio::select! {
                    () = self.shutdown.cancelled() => break,
                    ready = tokio::time::timeout(self.poll_interval, self.stream.readable()) => {
                        match ready {
                            Ok(Ok(())) => {
                                if let Some(msg) = self.receive_pending().await {
                                    debug!(len = msg.len(), "dispatching message");
                                    handler.on_message(&self, msg).await;
                                }
                            }
                            Ok(Err(e)) => self.fault("waiting for readability", &e),
                            Err(_elapsed) => {}
                        }
                    }
                }
                handler.loop_pass(&self).await;
            }

            self.set_state(ConnectionState::ShuttingDown);
            handler.post_loop(&self).await;
            self.close();
            self.set_state(ConnectionState::Closed);
            debug!("connection closed");
        }
        .instrument(span)
        .await;
    }

    async fn handshake(&self) -> bool {
        let _guard = self.exchange.lock().await;
        self.set_state(ConnectionState::Handshaking);

        if let Err(e) = self.write_all(&[ControlCode::Ok.as_byte()]).await {
            self.fault("writing handshake", &e);
            return false;
        }

        let mut reply = [0u8; 1];
        if let Err(e) = self.read_exact(&mut reply).await {
            self.fault("reading handshake", &e);
            return false;
        }

        let err = match ControlCode::from_byte(reply[0]) {
            Ok(ControlCode::Ok) => {
                self.handshake_done.store(true, Ordering::Release);
                self.set_state(ConnectionState::Running);
                info!("handshake complete");
                return true;
            }
            Ok(ControlCode::ConnLimit) => {
                warn!("rejected by peer: connection limit reached");
                ProtocolError::HandshakeRejected(ControlCode::ConnLimit)
            }
            Ok(code) => {
                warn!(%code, "handshake rejected");
                ProtocolError::HandshakeRejected(code)
            }
            Err(e) => {
                warn!(error = %e, "invalid handshake reply");
                e
            }
        };

        let _ = self.handshake_error.set(err);
        self.shutdown();
        false
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Close a connection whose task was aborted before it could finish.
    pub(crate) fn abandon(&self) {
        self.shutdown();
        self.close();
        self.set_state(ConnectionState::Closed);
    }

    fn fault(&self, during: &str, err: &io::Error) {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => debug!(connection = %self.id, during, "peer closed connection"),
            io::ErrorKind::Interrupted => trace!(connection = %self.id, during, "interrupted by shutdown"),
            _ => warn!(connection = %self.id, during, error = %err, "transport fault"),
        }
        self.shutdown();
    }

    /// Close the socket once. Later calls are no-ops.
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            trace!(connection = %self.id, error = %e, "socket shutdown failed");
        }
    }

    /// Read until `buf` is full, racing the shutdown signal.
    async fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            tokio::select! {
                () = self.shutdown.cancelled() => return Err(interrupted()),
                ready = self.stream.readable() => ready?,
            }
            match self.stream.try_read(&mut buf[filled..]) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Write all of `buf`, racing the shutdown signal.
    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            tokio::select! {
                () = self.shutdown.cancelled() => return Err(interrupted()),
                ready = self.stream.writable() => ready?,
            }
            match self.stream.try_write(&buf[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn interrupted() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "connection shut down")
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}
