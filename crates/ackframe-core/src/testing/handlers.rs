//! Recording and echoing handlers for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::network::{Connection, ConnectionHandler, ConnectionId, LifecycleHooks};

/// Shared view of what a set of [`RecordingHandler`]s observed.
#[derive(Debug, Clone, Default)]
pub struct Recording {
    inner: Arc<RecordingInner>,
}

#[derive(Debug, Default)]
struct RecordingInner {
    messages: Mutex<Vec<Bytes>>,
    pre_loop: AtomicUsize,
    post_loop: AtomicUsize,
    loop_passes: AtomicUsize,
}

impl Recording {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler factory feeding this recording.
    pub fn factory(&self) -> impl Fn() -> Box<dyn ConnectionHandler> + Send + Sync + 'static {
        let recording = self.clone();
        move || -> Box<dyn ConnectionHandler> {
            Box::new(RecordingHandler::new(recording.clone()))
        }
    }

    /// Messages observed so far, across all connections.
    pub fn messages(&self) -> Vec<Bytes> {
        self.inner
            .messages
            .lock()
            .expect("recording lock poisoned")
            .clone()
    }

    pub fn message_count(&self) -> usize {
        self.inner
            .messages
            .lock()
            .expect("recording lock poisoned")
            .len()
    }

    pub fn pre_loop_calls(&self) -> usize {
        self.inner.pre_loop.load(Ordering::SeqCst)
    }

    pub fn post_loop_calls(&self) -> usize {
        self.inner.post_loop.load(Ordering::SeqCst)
    }

    pub fn loop_passes(&self) -> usize {
        self.inner.loop_passes.load(Ordering::SeqCst)
    }

    fn push(&self, payload: Bytes) {
        self.inner
            .messages
            .lock()
            .expect("recording lock poisoned")
            .push(payload);
    }
}

/// Records every hook call into a [`Recording`].
#[derive(Debug)]
pub struct RecordingHandler {
    recording: Recording,
    echo: bool,
}

impl RecordingHandler {
    #[must_use]
    pub fn new(recording: Recording) -> Self {
        Self {
            recording,
            echo: false,
        }
    }

    /// Also transmit every received message back to the peer.
    #[must_use]
    pub fn echoing(mut self) -> Self {
        self.echo = true;
        self
    }
}

#[async_trait]
impl ConnectionHandler for RecordingHandler {
    async fn pre_loop(&mut self, _conn: &Connection) {
        self.recording.inner.pre_loop.fetch_add(1, Ordering::SeqCst);
    }

    async fn post_loop(&mut self, _conn: &Connection) {
        self.recording.inner.post_loop.fetch_add(1, Ordering::SeqCst);
    }

    async fn loop_pass(&mut self, _conn: &Connection) {
        self.recording.inner.loop_passes.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_message(&mut self, conn: &Connection, payload: Bytes) {
        self.recording.push(payload.clone());
        if self.echo {
            let _ = conn.transmit(payload).await;
        }
    }
}

/// Transmits every received message back unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl ConnectionHandler for EchoHandler {
    async fn on_message(&mut self, conn: &Connection, payload: Bytes) {
        let _ = conn.transmit(payload).await;
    }
}

/// Records lifecycle notifications by connection id.
#[derive(Debug, Clone, Default)]
pub struct RecordingHooks {
    inits: Arc<Mutex<Vec<ConnectionId>>>,
    shutdowns: Arc<Mutex<Vec<ConnectionId>>>,
}

impl RecordingHooks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inits(&self) -> Vec<ConnectionId> {
        self.inits.lock().expect("hooks lock poisoned").clone()
    }

    pub fn shutdowns(&self) -> Vec<ConnectionId> {
        self.shutdowns.lock().expect("hooks lock poisoned").clone()
    }
}

impl LifecycleHooks for RecordingHooks {
    fn conn_init(&self, id: &ConnectionId, _conn: &Connection) {
        self.inits.lock().expect("hooks lock poisoned").push(id.clone());
    }

    fn conn_shutdown(&self, id: &ConnectionId, _conn: &Connection) {
        self.shutdowns
            .lock()
            .expect("hooks lock poisoned")
            .push(id.clone());
    }
}
