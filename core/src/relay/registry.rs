//! Connection registry: one live transport per identity

use super::protocol::RelayMessage;
use crate::identity::Identity;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Instruction for a connection's writer loop
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Write this frame to the socket
    Frame(RelayMessage),
    /// Close the socket with the given reason
    Close(String),
}

/// Handle to one admitted relay connection.
///
/// Cloning the handle does not clone the connection; every clone feeds the
/// same FIFO channel drained by the connection's own task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    identity: Arc<Identity>,
    created_at: Instant,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle plus the receiver the connection task drains
    pub fn open(identity: Identity) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            identity: Arc::new(identity),
            created_at: Instant::now(),
            tx,
        };
        (handle, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Identity cached at handshake; fixed for the connection's lifetime
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_id(&self) -> &str {
        &self.identity.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Queue a frame without waiting on the socket.
    ///
    /// Returns false if the connection task has already gone away.
    pub fn send(&self, message: RelayMessage) -> bool {
        self.tx.send(Outbound::Frame(message)).is_ok()
    }

    /// Ask the connection task to close the socket
    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Outbound::Close(reason.into()));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Process-wide map of user id → live connection.
///
/// The only shared mutable state on the relay. Every operation takes the
/// internal lock briefly and never awaits while holding it.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, superseding any existing one for the same user.
    ///
    /// The displaced connection is told to close before the lock is released,
    /// so at no point are two live entries visible. Returns the displaced
    /// handle, if any.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut connections = self.connections.write();
        let displaced = connections.insert(handle.user_id().to_string(), handle);
        if let Some(old) = &displaced {
            old.close("superseded by a newer connection");
            tracing::info!(
                user = %old.user_id(),
                connection = old.id(),
                "Closed superseded connection"
            );
        }
        displaced
    }

    /// Current connection for a user
    pub fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.connections.read().get(user_id).cloned()
    }

    /// Remove a user's entry, but only if it still belongs to `connection_id`.
    ///
    /// A superseded connection tearing down late must not evict its successor.
    pub fn unregister(&self, user_id: &str, connection_id: u64) -> bool {
        let mut connections = self.connections.write();
        match connections.get(user_id) {
            Some(current) if current.id() == connection_id => {
                connections.remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// All connections whose identity matches the predicate
    pub fn for_each<F>(&self, predicate: F) -> Vec<ConnectionHandle>
    where
        F: Fn(&Identity) -> bool,
    {
        self.connections
            .read()
            .values()
            .filter(|c| predicate(c.identity()))
            .cloned()
            .collect()
    }

    pub fn is_registered(&self, user_id: &str) -> bool {
        self.connections.read().contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::open(Identity::patient("p1", "Pat"));
        let id = handle.id();

        assert!(registry.register(handle).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("p1").unwrap().id(), id);
        assert!(registry.lookup("p2").is_none());
    }

    #[test]
    fn test_second_registration_closes_first() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = ConnectionHandle::open(Identity::patient("p1", "Pat"));
        let (second, mut second_rx) = ConnectionHandle::open(Identity::patient("p1", "Pat"));
        let first_id = first.id();
        let second_id = second.id();

        registry.register(first);
        let displaced = registry.register(second).unwrap();

        assert_eq!(displaced.id(), first_id);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("p1").unwrap().id(), second_id);
        assert!(matches!(first_rx.try_recv(), Ok(Outbound::Close(_))));
        assert!(second_rx.try_recv().is_err());
    }

    #[test]
    fn test_stale_unregister_keeps_successor() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = ConnectionHandle::open(Identity::patient("p1", "Pat"));
        let (second, _rx2) = ConnectionHandle::open(Identity::patient("p1", "Pat"));
        let first_id = first.id();
        let second_id = second.id();

        registry.register(first);
        registry.register(second);

        assert!(!registry.unregister("p1", first_id));
        assert!(registry.is_registered("p1"));
        assert!(registry.unregister("p1", second_id));
        assert!(registry.is_empty());
        assert!(!registry.unregister("p1", second_id));
    }

    #[test]
    fn test_for_each_filters_by_identity() {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        for identity in [
            Identity::patient("p1", "Pat"),
            Identity::guardian("g1", "Gail", "p1"),
            Identity::doctor("d1", "Dana", "p1"),
            Identity::guardian("g2", "Gus", "p2"),
        ] {
            let (handle, rx) = ConnectionHandle::open(identity);
            receivers.push(rx);
            registry.register(handle);
        }

        let mut linked: Vec<String> = registry
            .for_each(|u| u.is_linked_to("p1"))
            .iter()
            .map(|c| c.user_id().to_string())
            .collect();
        linked.sort();
        assert_eq!(linked, vec!["d1".to_string(), "g1".to_string()]);
    }

    #[test]
    fn test_concurrent_registrations_leave_one_winner() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut threads = Vec::new();

        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            threads.push(std::thread::spawn(move || {
                let (handle, rx) = ConnectionHandle::open(Identity::patient("p1", "Pat"));
                let id = handle.id();
                registry.register(handle);
                (id, rx)
            }));
        }

        let mut results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(registry.len(), 1);
        let winner = registry.lookup("p1").unwrap().id();

        for (id, rx) in results.iter_mut() {
            let closed = matches!(rx.try_recv(), Ok(Outbound::Close(_)));
            assert_eq!(closed, *id != winner, "connection {} close state", id);
        }
    }

    #[test]
    fn test_send_after_task_gone() {
        let (handle, rx) = ConnectionHandle::open(Identity::patient("p1", "Pat"));
        assert!(handle.send(RelayMessage::Ping));
        drop(rx);
        assert!(!handle.send(RelayMessage::Ping));
        assert!(handle.is_closed());
    }
}
