//! Registered upstream servers.

use crate::backend::server::{Health, Server, ServerDescriptor};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

/// The set of registered servers, in registration order.
///
/// Readers load an immutable snapshot and never block; writers serialize on
/// a mutex and publish a new snapshot.
#[derive(Debug)]
pub struct ServerRegistry {
    servers: ArcSwap<Vec<Arc<Server>>>,
    write_lock: Mutex<()>,
}

impl ServerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            servers: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Register a server. Returns false if the ID is already taken.
    pub fn add_server(&self, descriptor: ServerDescriptor) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.servers.load();

        if current.iter().any(|s| s.id() == descriptor.id) {
            warn!(server = %descriptor.id, "server already registered");
            return false;
        }

        info!(
            server = %descriptor.id,
            address = %descriptor.authority(),
            weight = descriptor.weight,
            "server registered"
        );

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(Arc::new(Server::new(descriptor)));
        self.servers.store(Arc::new(next));
        true
    }

    /// Deregister a server. Returns false if the ID is unknown.
    pub fn remove_server(&self, id: &str) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.servers.load();

        if !current.iter().any(|s| s.id() == id) {
            return false;
        }

        let next: Vec<Arc<Server>> = current.iter().filter(|s| s.id() != id).cloned().collect();
        self.servers.store(Arc::new(next));
        info!(server = id, "server deregistered");
        true
    }

    /// Look up a server by ID.
    pub fn get(&self, id: &str) -> Option<Arc<Server>> {
        self.servers.load().iter().find(|s| s.id() == id).cloned()
    }

    /// Whether this exact server is still registered.
    ///
    /// False once it is removed, even if another server has since been
    /// registered under the same ID.
    pub fn is_registered(&self, server: &Arc<Server>) -> bool {
        self.servers.load().iter().any(|s| Arc::ptr_eq(s, server))
    }

    /// Snapshot of every registered server.
    pub fn servers(&self) -> Arc<Vec<Arc<Server>>> {
        self.servers.load_full()
    }

    /// Servers whose last probe succeeded, in registration order.
    pub fn healthy_servers(&self) -> Vec<Arc<Server>> {
        self.servers
            .load()
            .iter()
            .filter(|s| s.is_healthy())
            .cloned()
            .collect()
    }

    /// Set a server's health flag.
    ///
    /// Returns `None` if the server is unknown, otherwise whether the flag
    /// actually changed. Circuit breaker state is left alone.
    pub fn update_health(&self, id: &str, healthy: bool) -> Option<bool> {
        let server = self.get(id)?;
        let health = if healthy {
            Health::Healthy
        } else {
            Health::Unhealthy
        };

        let changed = server.runtime().set_health(health);
        if changed {
            if healthy {
                info!(server = id, "server marked healthy");
            } else {
                warn!(server = id, "server marked unhealthy");
            }
        }
        Some(changed)
    }

    /// Number of registered servers.
    pub fn len(&self) -> usize {
        self.servers.load().len()
    }

    /// Whether no servers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(ids: &[&str]) -> ServerRegistry {
        let registry = ServerRegistry::new();
        for (i, id) in ids.iter().enumerate() {
            assert!(registry.add_server(ServerDescriptor::new(*id, "127.0.0.1", 9000 + i as u16)));
        }
        registry
    }

    #[test]
    fn test_add_duplicate_rejected() {
        let registry = registry_with(&["s1"]);
        assert!(!registry.add_server(ServerDescriptor::new("s1", "127.0.0.1", 9999)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_server() {
        let registry = registry_with(&["s1", "s2"]);
        assert!(registry.remove_server("s1"));
        assert!(!registry.remove_server("s1"));
        assert!(registry.get("s1").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_new_servers_not_healthy_until_probed() {
        let registry = registry_with(&["s1", "s2"]);
        assert!(registry.healthy_servers().is_empty());
    }

    #[test]
    fn test_healthy_servers_in_registration_order() {
        let registry = registry_with(&["s3", "s1", "s2"]);
        for id in ["s1", "s2", "s3"] {
            registry.update_health(id, true);
        }

        let ids: Vec<String> = registry
            .healthy_servers()
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(ids, vec!["s3", "s1", "s2"]);
    }

    #[test]
    fn test_update_health_idempotent() {
        let registry = registry_with(&["s1"]);
        assert_eq!(registry.update_health("s1", true), Some(true));
        assert_eq!(registry.update_health("s1", true), Some(false));
        assert_eq!(registry.update_health("s1", false), Some(true));
        assert_eq!(registry.update_health("missing", true), None);
        assert!(registry.healthy_servers().is_empty());
    }

    #[test]
    fn test_snapshot_survives_removal() {
        let registry = registry_with(&["s1", "s2"]);
        let snapshot = registry.servers();
        registry.remove_server("s2");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.servers().len(), 1);
    }

    #[test]
    fn test_is_registered_tracks_instance() {
        let registry = registry_with(&["s1"]);
        let old = registry.get("s1").unwrap();
        assert!(registry.is_registered(&old));

        registry.remove_server("s1");
        assert!(!registry.is_registered(&old));

        registry.add_server(ServerDescriptor::new("s1", "127.0.0.1", 9000));
        assert!(!registry.is_registered(&old));
        assert!(registry.is_registered(&registry.get("s1").unwrap()));
    }
}
