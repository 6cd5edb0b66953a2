use crate::metrics::METRICS;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifier of one client connection, rendered as `[C<hex>]` in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[C{:x}]", self.0)
    }
}

/// Hands out connection ids, starting at 1
#[derive(Debug)]
pub struct ConnectionIds {
    next: AtomicU64,
}

impl ConnectionIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionIds {
    fn default() -> Self {
        Self::new()
    }
}

/// What is known about a live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEntry {
    pub address: String,
    pub user: Option<String>,
}

/// Registry of active WebSocket connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a connection until the returned guard is dropped
    pub fn register(self: &Arc<Self>, id: ConnectionId, address: impl Into<String>) -> Registration {
        self.connections.insert(
            id,
            ConnectionEntry {
                address: address.into(),
                user: None,
            },
        );
        METRICS.active_connections.inc();
        Registration {
            registry: self.clone(),
            id,
        }
    }

    pub fn unregister(&self, id: ConnectionId) {
        if self.connections.remove(&id).is_some() {
            METRICS.active_connections.dec();
        }
    }

    pub fn set_user(&self, id: ConnectionId, user: Option<String>) {
        if let Some(mut entry) = self.connections.get_mut(&id) {
            entry.user = user;
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionEntry> {
        self.connections.get(&id).map(|entry| entry.clone())
    }

    /// Get number of active connections
    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

/// Removes its connection from the registry on drop
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Registration {
    pub fn set_user(&self, user: Option<String>) {
        self.registry.set_user(self.id, user);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(1).to_string(), "[C1]");
        assert_eq!(ConnectionId::new(255).to_string(), "[Cff]");
    }

    #[test]
    fn test_ids_are_sequential() {
        let ids = ConnectionIds::new();
        assert_eq!(ids.next().get(), 1);
        assert_eq!(ids.next().get(), 2);

        let ids = ConnectionIds::starting_at(0x10);
        assert_eq!(ids.next().to_string(), "[C10]");
    }

    #[test]
    fn test_registration_lifecycle() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new(7);

        let registration = registry.register(id, "10.0.0.1");
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get(id).unwrap().user, None);

        registration.set_user(Some("alice".to_string()));
        assert_eq!(registry.get(id).unwrap().user.as_deref(), Some("alice"));

        drop(registration);
        assert_eq!(registry.count(), 0);
        assert!(registry.get(id).is_none());
    }
}
