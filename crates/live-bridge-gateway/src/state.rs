//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use live_bridge_agent::AgentConnector;
use live_bridge_core::config::Config;

use crate::session::SessionRegistry;
use crate::transport::PeerConnector;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub agent: Arc<dyn AgentConnector>,
    pub peers: Arc<dyn PeerConnector>,
    pub connections: Arc<ConnectionRegistry>,
    pub sessions: Arc<SessionRegistry>,
}

/// Per-connection state.
pub struct ConnectionState {
    pub conn_id: String,
    pub event_tx: mpsc::UnboundedSender<String>,
}

/// Live signaling connections, keyed by connection id (the room name).
///
/// Agent output is pushed from synchronous contexts, so the map sits behind a
/// sync lock that is never held across an `.await`.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<String, ConnectionState>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: ConnectionState) {
        self.inner.write().insert(conn.conn_id.clone(), conn);
    }

    pub fn remove(&self, conn_id: &str) -> bool {
        self.inner.write().remove(conn_id).is_some()
    }

    pub fn contains(&self, conn_id: &str) -> bool {
        self.inner.read().contains_key(conn_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Queue a serialized frame for one connection.
    pub fn send_to(&self, conn_id: &str, frame: String) -> bool {
        self.inner
            .read()
            .get(conn_id)
            .is_some_and(|conn| conn.event_tx.send(frame).is_ok())
    }
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        agent: Arc<dyn AgentConnector>,
        peers: Arc<dyn PeerConnector>,
    ) -> Self {
        Self {
            config,
            agent,
            peers,
            connections: Arc::new(ConnectionRegistry::new()),
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    /// Tear down every session. Used on shutdown.
    pub fn shutdown_sessions(&self) -> usize {
        let sessions = self.sessions.drain();
        let count = sessions.len();
        for session in sessions {
            session.teardown();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_registry_send() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.insert(ConnectionState {
            conn_id: "a".into(),
            event_tx: tx,
        });

        assert!(registry.contains("a"));
        assert!(registry.send_to("a", "hi".into()));
        assert!(!registry.send_to("b", "hi".into()));
        assert_eq!(rx.try_recv().unwrap(), "hi");

        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(registry.is_empty());
    }
}
