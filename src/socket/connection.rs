use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use super::types::lock;

// ============================================================================
// Connection
// ============================================================================

/// Process-unique identity of a connection.
///
/// Remote address strings are not unique (two connections from one host share one), so
/// removal and lookup go through this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One live transport endpoint.
///
/// `H` is the transport handle, owned exclusively by this connection.
#[derive(Debug)]
pub struct Connection<H> {
    id: ConnectionId,
    remote_address: String,
    handle: H,
}

impl<H> Connection<H> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer IP as a string, derived once at accept time
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub(crate) fn handle(&self) -> &H {
        &self.handle
    }
}

// ============================================================================
// ConnectionRegistry
// ============================================================================

/// Live connections of one server, shared by the accept path and every connection task.
///
/// Lookups return snapshots so that I/O on the returned connections never happens while the
/// registry lock is held.
#[derive(Debug)]
pub(crate) struct ConnectionRegistry<H> {
    connections: Mutex<Vec<Arc<Connection<H>>>>,
    next_id: AtomicU64,
}

impl<H> ConnectionRegistry<H> {
    pub(crate) fn new() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Wraps the handle in a new connection and appends it
    pub(crate) fn register(&self, remote_address: String, handle: H) -> Arc<Connection<H>> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let connection = Arc::new(Connection { id, remote_address, handle });
        lock!(self.connections).push(Arc::clone(&connection));
        connection
    }

    /// Removes the connection, returning it if it was still registered
    pub(crate) fn remove(&self, id: ConnectionId) -> Option<Arc<Connection<H>>> {
        let mut connections = lock!(self.connections);
        let index = connections.iter().position(|c| c.id == id)?;
        Some(connections.remove(index))
    }

    /// Every connection whose remote address equals `remote_address`, the sender included
    pub(crate) fn matching(&self, remote_address: &str) -> Vec<Arc<Connection<H>>> {
        lock!(self.connections)
            .iter()
            .filter(|c| c.remote_address == remote_address)
            .cloned()
            .collect()
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<Arc<Connection<H>>> {
        lock!(self.connections).iter().find(|c| c.id == id).cloned()
    }

    pub(crate) fn contains(&self, id: ConnectionId) -> bool {
        lock!(self.connections).iter().any(|c| c.id == id)
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Connection<H>>> {
        lock!(self.connections).clone()
    }

    pub(crate) fn remote_addresses(&self) -> Vec<String> {
        lock!(self.connections).iter().map(|c| c.remote_address.clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock!(self.connections).len()
    }

    /// Empties the registry, handing every connection to the caller for closing
    pub(crate) fn drain(&self) -> Vec<Arc<Connection<H>>> {
        std::mem::take(&mut *lock!(self.connections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn matching_returns_every_connection_with_the_same_address() {
        let registry = ConnectionRegistry::new();
        let a = registry.register("10.0.0.1".to_string(), "a");
        let b = registry.register("10.0.0.1".to_string(), "b");
        let c = registry.register("10.0.0.2".to_string(), "c");

        let matched: Vec<_> = registry.matching("10.0.0.1").iter().map(|m| m.id()).collect();
        assert_eq!(matched, vec![a.id(), b.id()]);
        assert!(!matched.contains(&c.id()));
        assert!(registry.matching("10.0.0.3").is_empty());
    }

    #[test]
    fn remove_uses_the_id_not_the_address() {
        let registry = ConnectionRegistry::new();
        let a = registry.register("10.0.0.1".to_string(), 1);
        let b = registry.register("10.0.0.1".to_string(), 2);

        let removed = registry.remove(a.id()).unwrap();
        assert_eq!(*removed.handle(), 1);
        assert!(!registry.contains(a.id()));
        assert!(registry.contains(b.id()));
        assert!(registry.remove(a.id()).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn drain_empties_the_registry() {
        let registry = ConnectionRegistry::new();
        registry.register("10.0.0.1".to_string(), ());
        registry.register("10.0.0.2".to_string(), ());

        assert_eq!(registry.drain().len(), 2);
        assert_eq!(registry.len(), 0);
        assert!(registry.remote_addresses().is_empty());
    }

    #[test]
    fn concurrent_register_and_remove_lose_nothing() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..100 {
                        let connection = registry.register(format!("10.0.{}.{}", t, i), ());
                        if i % 2 == 0 {
                            assert!(registry.remove(connection.id()).is_some());
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 8 * 50);
    }
}
