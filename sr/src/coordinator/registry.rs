//! Endpoint registry
//!
//! The only state shared between connection tasks. Every method takes the
//! lock for a pure table read or write and releases it before returning, so
//! callers never hold it across I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::outbox::Outbox;
use crate::protocol::Role;

/// A named, live connection
///
/// Dropping the last copy of an endpoint closes its queue, which lets the
/// writer finish what is queued and exit.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub role: Role,
    /// Distinguishes successive connections that claimed the same name
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub peer: String,
    outbox: Outbox,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, role: Role, peer: impl Into<String>, outbox: Outbox) -> Self {
        Self {
            name: name.into(),
            role,
            connection_id: Uuid::now_v7(),
            connected_at: Utc::now(),
            peer: peer.into(),
            outbox,
        }
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    pub fn info(&self) -> EndpointInfo {
        EndpointInfo {
            name: self.name.clone(),
            role: self.role,
            connection_id: self.connection_id,
            connected_at: self.connected_at,
            peer: self.peer.clone(),
        }
    }
}

/// Metadata snapshot of an endpoint, safe to hand out
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointInfo {
    pub name: String,
    pub role: Role,
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub peer: String,
}

#[derive(Default)]
struct Table {
    endpoints: HashMap<String, Endpoint>,
    /// Broadcast order: first registration order, never reshuffled
    order: Vec<String>,
}

/// Thread-safe table of named endpoints
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<Table>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        // A panic while holding the lock cannot leave the table half-written
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an endpoint, replacing any prior entry of the same name
    ///
    /// The replaced endpoint is returned untouched; its connection is not closed.
    pub fn register(&self, endpoint: Endpoint) -> Option<Endpoint> {
        debug!(name = %endpoint.name, role = %endpoint.role, "Registry::register: called");
        let mut table = self.table();
        let name = endpoint.name.clone();
        let previous = table.endpoints.insert(name.clone(), endpoint);
        if previous.is_none() {
            table.order.push(name);
        }
        previous
    }

    /// Remove the entry for `name`, whatever connection owns it
    pub fn deregister(&self, name: &str) -> Option<Endpoint> {
        debug!(%name, "Registry::deregister: called");
        let mut table = self.table();
        let removed = table.endpoints.remove(name);
        if removed.is_some() {
            table.order.retain(|n| n != name);
        }
        removed
    }

    /// Remove the entry for `name` only if it still belongs to `connection_id`
    pub fn deregister_connection(&self, name: &str, connection_id: Uuid) -> Option<Endpoint> {
        debug!(%name, %connection_id, "Registry::deregister_connection: called");
        let mut table = self.table();
        match table.endpoints.get(name) {
            Some(endpoint) if endpoint.connection_id == connection_id => {
                table.order.retain(|n| n != name);
                table.endpoints.remove(name)
            }
            _ => None,
        }
    }

    /// Resolve the queue registered under `name`
    pub fn resolve(&self, name: &str) -> Option<(Uuid, Outbox)> {
        let table = self.table();
        table
            .endpoints
            .get(name)
            .map(|endpoint| (endpoint.connection_id, endpoint.outbox()))
    }

    pub fn lookup(&self, name: &str) -> Option<EndpointInfo> {
        self.table().endpoints.get(name).map(Endpoint::info)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table().endpoints.contains_key(name)
    }

    /// Point-in-time copy of the broadcast order
    pub fn names(&self) -> Vec<String> {
        self.table().order.clone()
    }

    /// Point-in-time copy of every endpoint's metadata, in broadcast order
    pub fn snapshot(&self) -> Vec<EndpointInfo> {
        let table = self.table();
        table
            .order
            .iter()
            .filter_map(|name| table.endpoints.get(name))
            .map(Endpoint::info)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    fn endpoint(name: &str, role: Role, peer: &str) -> Endpoint {
        Endpoint::new(name, role, peer, Outbox::channel(4).0)
    }

    #[test]
    fn test_register_same_name_replaces_entry() {
        let registry = Registry::new();
        registry.register(endpoint("db", Role::Persistence, "10.0.0.1:4000"));
        let previous = registry.register(endpoint("db", Role::Unknown, "10.0.0.2:4001"));

        assert!(previous.is_some());
        assert_eq!(previous.unwrap().info().peer, "10.0.0.1:4000");

        let info = registry.lookup("db").unwrap();
        assert_eq!(info.peer, "10.0.0.2:4001");
        assert_eq!(info.role, Role::Unknown);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["db".to_string()]);
    }

    #[test]
    fn test_order_is_insertion_order() {
        let registry = Registry::new();
        registry.register(endpoint("sim", Role::Simulator, "a"));
        registry.register(endpoint("db", Role::Persistence, "b"));
        registry.register(endpoint("map", Role::Visualizer, "c"));
        // Re-registration keeps the original slot
        registry.register(endpoint("sim", Role::Simulator, "d"));

        assert_eq!(registry.names(), vec!["sim", "db", "map"]);
        let roles: Vec<Role> = registry.snapshot().into_iter().map(|i| i.role).collect();
        assert_eq!(roles, vec![Role::Simulator, Role::Persistence, Role::Visualizer]);
    }

    #[test]
    fn test_deregister_removes_from_order() {
        let registry = Registry::new();
        registry.register(endpoint("sim", Role::Simulator, "a"));
        registry.register(endpoint("db", Role::Persistence, "b"));

        assert!(registry.deregister("sim").is_some());
        assert!(registry.deregister("sim").is_none());
        assert_eq!(registry.names(), vec!["db"]);
        assert!(!registry.contains("sim"));
    }

    #[test]
    fn test_stale_connection_cannot_deregister_replacement() {
        let registry = Registry::new();
        let first = endpoint("map", Role::Visualizer, "a");
        let first_id = first.connection_id;
        registry.register(first);
        let second = endpoint("map", Role::Visualizer, "b");
        let second_id = second.connection_id;
        registry.register(second);

        assert!(registry.deregister_connection("map", first_id).is_none());
        assert_eq!(registry.lookup("map").unwrap().peer, "b");

        assert!(registry.deregister_connection("map", second_id).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resolve_returns_current_connection() {
        let registry = Registry::new();
        let (outbox, mut inbox) = Outbox::channel(4);
        let ep = Endpoint::new("db", Role::Persistence, "a", outbox);
        let id = ep.connection_id;
        registry.register(ep);

        let (resolved_id, resolved) = registry.resolve("db").unwrap();
        assert_eq!(resolved_id, id);
        resolved.try_send(Message::ResetState {}).unwrap();
        assert_eq!(inbox.try_recv(), Some(Message::ResetState {}));
        assert!(registry.resolve("nope").is_none());
    }
}
