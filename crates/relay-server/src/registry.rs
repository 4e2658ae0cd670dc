//! Registry of online identities.
//!
//! The single source of truth for "who is online". Every method holds
//! the lock only for the map operation itself and never across a send:
//! callers copy handles out and deliver after the guard is dropped.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use relay_core::Identity;
use tokio::sync::RwLock;

use crate::types::{ConnectionId, SessionHandle};

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Identity, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    /// Install `handle` as the session for its identity.
    ///
    /// Returns the session it replaced, if any; last login wins.
    pub async fn put(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let mut guard = self.sessions.write().await;
        guard.insert(handle.identity.clone(), handle)
    }

    /// Remove the session for `identity`, but only while `conn_id` still
    /// owns it. A stale handler cannot evict a newer login.
    pub async fn remove(&self, identity: &str, conn_id: ConnectionId) -> bool {
        let mut guard = self.sessions.write().await;
        let owned = guard
            .get(identity)
            .map_or(false, |current| current.conn_id == conn_id);
        if owned {
            guard.remove(identity);
        }
        owned
    }

    pub async fn get(&self, identity: &str) -> Option<SessionHandle> {
        let guard = self.sessions.read().await;
        guard.get(identity).cloned()
    }

    /// Online identities, ordered.
    pub async fn snapshot(&self) -> BTreeSet<Identity> {
        let guard = self.sessions.read().await;
        guard.keys().cloned().collect()
    }

    /// Copies of every live handle, for fan-out outside the lock.
    pub async fn handles(&self) -> Vec<SessionHandle> {
        let guard = self.sessions.read().await;
        guard.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{mpsc, Notify};

    fn handle(id: u64, identity: &str) -> SessionHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        SessionHandle::new(ConnectionId(id), identity, tx, Arc::new(Notify::new()))
    }

    #[tokio::test]
    async fn put_returns_superseded_session() {
        let registry = SessionRegistry::new();

        assert!(registry.put(handle(1, "alice")).await.is_none());
        let prev = registry.put(handle(2, "alice")).await.unwrap();

        assert_eq!(prev.conn_id, ConnectionId(1));
        assert_eq!(registry.len().await, 1);
        assert_eq!(
            registry.get("alice").await.unwrap().conn_id,
            ConnectionId(2)
        );
    }

    #[tokio::test]
    async fn stale_remove_is_a_no_op() {
        let registry = SessionRegistry::new();
        registry.put(handle(1, "alice")).await;
        registry.put(handle(2, "alice")).await;

        assert!(!registry.remove("alice", ConnectionId(1)).await);
        assert!(registry.get("alice").await.is_some());

        assert!(registry.remove("alice", ConnectionId(2)).await);
        assert!(registry.is_empty().await);
        assert!(!registry.remove("alice", ConnectionId(2)).await);
    }

    #[tokio::test]
    async fn snapshot_is_ordered() {
        let registry = SessionRegistry::new();
        registry.put(handle(1, "carol")).await;
        registry.put(handle(2, "alice")).await;
        registry.put(handle(3, "bob")).await;

        let names: Vec<_> = registry.snapshot().await.into_iter().collect();
        assert_eq!(names, vec!["alice", "bob", "carol"]);
        assert_eq!(registry.handles().await.len(), 3);
    }
}
