//! Live connection table shared by an owner and its handles.
//!
//! Only the owner (the server accept loop or the client) inserts and reaps;
//! handles get read-only lookups.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::connection::{Connection, ConnectionId};
use super::hooks::LifecycleHooks;

const DRAIN_POLL: Duration = Duration::from_millis(5);

struct Entry {
    conn: Arc<Connection>,
    task: JoinHandle<()>,
}

/// Map from connection id to the connection and its task.
#[derive(Default)]
pub struct Registry {
    entries: DashMap<ConnectionId, Entry>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered connections, finished or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.entries.get(id).map(|e| Arc::clone(&e.conn))
    }

    /// Generate an id not currently in the table.
    pub(crate) fn fresh_id(&self) -> ConnectionId {
        loop {
            let id = ConnectionId::generate();
            if !self.entries.contains_key(&id) {
                return id;
            }
            debug!(%id, "connection id collision, regenerating");
        }
    }

    pub(crate) fn insert(&self, id: ConnectionId, conn: Arc<Connection>, task: JoinHandle<()>) {
        self.entries.insert(id, Entry { conn, task });
    }

    /// Remove every connection whose task has exited, firing `conn_shutdown`.
    pub(crate) fn reap(&self, hooks: &dyn LifecycleHooks) -> usize {
        let finished: Vec<ConnectionId> = self
            .entries
            .iter()
            .filter(|e| e.task.is_finished())
            .map(|e| e.key().clone())
            .collect();

        let mut reaped = 0;
        for id in finished {
            if let Some((id, entry)) = self.entries.remove(&id) {
                hooks.conn_shutdown(&id, &entry.conn);
                debug!(%id, "reaped connection");
                reaped += 1;
            }
        }
        reaped
    }

    /// Signal every registered connection to stop.
    pub(crate) fn shutdown_all(&self) {
        for entry in &self.entries {
            entry.conn.shutdown();
        }
    }

    /// Wait up to `grace` for every task to exit, aborting stragglers.
    pub(crate) async fn drain(&self, grace: Duration) {
        let all_finished = || self.entries.iter().all(|e| e.task.is_finished());

        let waited = tokio::time::timeout(grace, async {
            while !all_finished() {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await;

        if waited.is_err() {
            let mut aborted = 0;
            for entry in &self.entries {
                if !entry.task.is_finished() {
                    entry.task.abort();
                    entry.conn.abandon();
                    aborted += 1;
                }
            }
            warn!(aborted, grace_ms = grace.as_millis() as u64, "aborted connections after grace period");
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}
