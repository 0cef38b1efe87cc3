//! Live connection registry
//!
//! Maps an authenticated user id to at most one live channel. Duplicate
//! logins are last-connect-wins: registering over an existing entry returns
//! the displaced connection so the caller can push an explicit close to it
//! instead of leaking it until its socket times out.
//!
//! The map is the only shared mutable resource in the realtime core. All
//! mutation happens inside short lock sections and never across an await.

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Frame pushed through a connection's outbound channel.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// A pre-serialized event envelope.
    Event(String),
    /// Ask the connection task to close the socket and stop.
    Close { reason: &'static str },
}

/// A registered live channel for one authenticated user.
#[derive(Debug, Clone)]
pub struct LiveConnection {
    pub user_id: String,
    pub username: String,
    pub name: String,
    /// Distinguishes this socket from a superseded one for the same user.
    pub connection_id: Uuid,
    pub sender: mpsc::UnboundedSender<OutboundFrame>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl LiveConnection {
    pub fn new(
        user_id: String,
        username: String,
        name: String,
        sender: mpsc::UnboundedSender<OutboundFrame>,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            username,
            name,
            connection_id: Uuid::new_v4(),
            sender,
            connected_at: now,
            last_heartbeat: now,
        }
    }
}

/// Operational snapshot of one connected user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveClient {
    pub user_id: String,
    pub username: String,
    pub name: String,
}

/// Registry of all live connections, keyed by user id.
pub struct ConnectionRegistry {
    clients: RwLock<AHashMap<String, LiveConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self { clients: RwLock::new(AHashMap::new()) }
    }

    /// Store the mapping. If the user already had a live channel the prior
    /// entry is displaced and returned; it is no longer addressable here.
    pub fn register(&self, conn: LiveConnection) -> Option<LiveConnection> {
        let mut clients = self.clients.write();
        let superseded = clients.insert(conn.user_id.clone(), conn);
        if superseded.is_some() {
            tracing::info!("Superseding existing connection (last-connect-wins)");
        }
        superseded
    }

    /// Remove the mapping, but only if it still belongs to the calling
    /// connection. A late unregister from a superseded socket is a no-op.
    /// Returns whether an entry was actually removed. Idempotent.
    pub fn unregister(&self, user_id: &str, connection_id: Uuid) -> bool {
        let mut clients = self.clients.write();
        match clients.get(user_id) {
            Some(current) if current.connection_id == connection_id => {
                clients.remove(user_id);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, user_id: &str) -> Option<LiveConnection> {
        self.clients.read().get(user_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<LiveConnection> {
        self.clients.read().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn list_active(&self) -> Vec<ActiveClient> {
        self.clients
            .read()
            .values()
            .map(|c| ActiveClient {
                user_id: c.user_id.clone(),
                username: c.username.clone(),
                name: c.name.clone(),
            })
            .collect()
    }

    /// Record heartbeat liveness for a user's current connection.
    pub fn touch(&self, user_id: &str) {
        if let Some(conn) = self.clients.write().get_mut(user_id) {
            conn.last_heartbeat = Utc::now();
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
