//! Client connection registry
//!
//! Maps live connections to addressable user ids. The registry only hands
//! out channel senders; actual socket writes happen in the connection tasks.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-connection outbound channel capacity.
const CONNECTION_CHANNEL_CAPACITY: usize = 64;

/// Identity of one accepted connection, independent of any user id it may
/// later register under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Registry of open connections, user-id bindings and doctor observers.
#[derive(Default)]
pub struct ClientRegistry {
    /// Every open connection; this is the broadcast set.
    connections: RwLock<HashMap<ConnectionId, mpsc::Sender<String>>>,
    /// User id -> connection, last writer wins.
    users: RwLock<HashMap<String, ConnectionId>>,
    /// Patient id -> doctor user ids observing that patient.
    observers: RwLock<HashMap<i64, HashSet<i64>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new connection into the broadcast set.
    ///
    /// Returns the connection identity and the receiver its task drains for
    /// outbound payloads.
    pub fn add_connection(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CONNECTION_CHANNEL_CAPACITY);
        let id = ConnectionId::new();
        self.connections.write().insert(id, tx);
        (id, rx)
    }

    /// Bind a user id to a connection. A later binding for the same id
    /// replaces the earlier one without error.
    pub fn register(&self, user_id: &str, connection: ConnectionId) {
        self.users.write().insert(user_id.to_string(), connection);
    }

    /// Remove a connection and every user binding pointing at it.
    ///
    /// Removal is by connection identity, not by id: a connection may have
    /// registered under a changed or duplicate user id.
    pub fn unregister(&self, connection: ConnectionId) {
        self.connections.write().remove(&connection);
        self.users.write().retain(|_, bound| *bound != connection);
    }

    /// Sender for the connection a user id is bound to, if any.
    pub fn lookup(&self, user_id: &str) -> Option<mpsc::Sender<String>> {
        let users = self.users.read();
        let connection = users.get(user_id)?;
        self.connections.read().get(connection).cloned()
    }

    /// Snapshot of every open connection for broadcast delivery.
    pub fn broadcast_targets(&self) -> Vec<(ConnectionId, mpsc::Sender<String>)> {
        self.connections
            .read()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect()
    }

    /// Resolve a user id to its connection identity.
    pub fn connection_of(&self, user_id: &str) -> Option<ConnectionId> {
        self.users.read().get(user_id).copied()
    }

    /// Record a doctor as observer of a patient.
    pub fn add_observer(&self, patient_id: i64, doctor_id: i64) {
        self.observers
            .write()
            .entry(patient_id)
            .or_default()
            .insert(doctor_id);
    }

    /// Doctor user ids observing the given patient.
    pub fn observers_of(&self, patient_id: i64) -> Vec<i64> {
        self.observers
            .read()
            .get(&patient_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of open connections, for diagnostics.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_replaces_by_last_writer() {
        let registry = ClientRegistry::new();
        let (first, _rx1) = registry.add_connection();
        let (second, _rx2) = registry.add_connection();

        registry.register("5", first);
        registry.register("5", second);

        assert_eq!(registry.connection_of("5"), Some(second));

        registry.unregister(second);
        assert!(registry.lookup("5").is_none());
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn unregister_removes_all_bindings_by_identity() {
        let registry = ClientRegistry::new();
        let (conn, _rx) = registry.add_connection();

        // Same connection registered under two ids.
        registry.register("5", conn);
        registry.register("7", conn);

        registry.unregister(conn);
        assert!(registry.lookup("5").is_none());
        assert!(registry.lookup("7").is_none());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn observers_accumulate_per_patient() {
        let registry = ClientRegistry::new();
        registry.add_observer(8, 2);
        registry.add_observer(8, 3);
        registry.add_observer(8, 2);

        let mut observers = registry.observers_of(8);
        observers.sort_unstable();
        assert_eq!(observers, vec![2, 3]);
        assert!(registry.observers_of(9).is_empty());
    }
}
