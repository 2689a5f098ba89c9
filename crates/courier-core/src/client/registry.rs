//! Live server registry.
//!
//! The registry keeps three views of cluster membership:
//!
//! - `servers`: every descriptor ever registered, keyed by id
//! - `servers_map`: ids grouped by server type, in registration order
//! - `onlines`: liveness flag per id
//!
//! Every id in `servers_map` has an entry in `servers` and `onlines`. An id
//! marked offline stays in `servers_map` but is never handed to a router.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A peer node as announced by the cluster manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub server_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl ServerInfo {
    /// A server entry with no weight.
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        server_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            server_type: server_type.into(),
            weight: None,
        }
    }

    /// Set the weight used by weighted round-robin.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    /// `host:port` for connecting.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// "List live peers of type T".
pub trait MembershipSource: Send + Sync {
    fn servers_by_type(&self, server_type: &str) -> Vec<ServerInfo>;
}

/// A registry mutation, delivered synchronously to [`MembershipListener`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Added(ServerInfo),
    Removed {
        server_id: String,
        /// `None` when the id was never registered.
        server_type: Option<String>,
    },
}

/// Subscriber to registry add/remove notifications.
pub trait MembershipListener: Send + Sync {
    fn on_membership(&self, event: &MembershipEvent);
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    servers: HashMap<String, ServerInfo>,
    servers_map: HashMap<String, Vec<String>>,
    onlines: HashMap<String, bool>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh a server and mark it online.
    ///
    /// Returns `false` (and changes nothing) for an empty id.
    pub fn add(&mut self, server: ServerInfo) -> bool {
        if server.id.is_empty() {
            return false;
        }
        if let Some(previous) = self.servers.get(&server.id) {
            if previous.server_type != server.server_type {
                let old_type = previous.server_type.clone();
                self.unlist(&old_type, &server.id);
            }
        }

        let ids = self.servers_map.entry(server.server_type.clone()).or_default();
        if !ids.contains(&server.id) {
            ids.push(server.id.clone());
        }
        self.onlines.insert(server.id.clone(), true);
        self.servers.insert(server.id.clone(), server);
        true
    }

    /// Mark a server offline. Its descriptor is kept.
    ///
    /// Returns the server type if the id is known.
    pub fn remove(&mut self, id: &str) -> Option<String> {
        self.onlines.insert(id.to_string(), false);
        self.servers.get(id).map(|s| s.server_type.clone())
    }

    /// Reset membership to exactly `servers`.
    ///
    /// Type lists and liveness flags are rebuilt; descriptors of servers not
    /// in the new list are kept but no longer reachable.
    pub fn replace(&mut self, servers: Vec<ServerInfo>) {
        self.onlines.clear();
        self.servers_map.clear();
        for server in servers {
            self.add(server);
        }
    }

    /// Entry for `id`, online or not.
    pub fn get(&self, id: &str) -> Option<&ServerInfo> {
        self.servers.get(id)
    }

    /// Whether `id` is in the online set.
    pub fn is_online(&self, id: &str) -> bool {
        self.onlines.get(id).copied().unwrap_or(false)
    }

    /// Online ids of a type, in registration order.
    pub fn online_ids(&self, server_type: &str) -> Vec<String> {
        self.servers_map
            .get(server_type)
            .map(|ids| {
                ids.iter()
                    .filter(|id| self.is_online(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Online servers of a type, in registration order.
    pub fn servers_by_type(&self, server_type: &str) -> Vec<ServerInfo> {
        self.online_ids(server_type)
            .iter()
            .filter_map(|id| self.servers.get(id).cloned())
            .collect()
    }

    /// Configured weight of `id`, if any.
    pub fn weight(&self, id: &str) -> Option<u32> {
        self.servers.get(id).and_then(|s| s.weight)
    }

    /// Every server type with at least one registered server, sorted.
    pub fn server_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.servers_map.keys().cloned().collect();
        types.sort();
        types
    }

    fn unlist(&mut self, server_type: &str, id: &str) {
        if let Some(ids) = self.servers_map.get_mut(server_type) {
            ids.retain(|existing| existing != id);
        }
    }
}

impl MembershipSource for Registry {
    fn servers_by_type(&self, server_type: &str) -> Vec<ServerInfo> {
        Registry::servers_by_type(self, server_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str) -> ServerInfo {
        ServerInfo::new(id, "127.0.0.1", 4000, "worker")
    }

    #[test]
    fn test_add_keeps_registration_order() {
        let mut registry = Registry::new();
        registry.add(worker("w-2"));
        registry.add(worker("w-1"));
        registry.add(worker("w-2"));

        assert_eq!(registry.online_ids("worker"), vec!["w-2", "w-1"]);
        assert!(registry.is_online("w-1"));
    }

    #[test]
    fn test_empty_id_ignored() {
        let mut registry = Registry::new();
        assert!(!registry.add(worker("")));
        assert!(registry.online_ids("worker").is_empty());
    }

    #[test]
    fn test_remove_marks_offline() {
        let mut registry = Registry::new();
        registry.add(worker("w-1"));
        registry.add(worker("w-2"));

        assert_eq!(registry.remove("w-1").as_deref(), Some("worker"));
        assert!(!registry.is_online("w-1"));
        assert!(registry.get("w-1").is_some());
        assert_eq!(registry.online_ids("worker"), vec!["w-2"]);

        assert!(registry.remove("ghost").is_none());
    }

    #[test]
    fn test_readd_brings_server_back() {
        let mut registry = Registry::new();
        registry.add(worker("w-1"));
        registry.remove("w-1");
        registry.add(worker("w-1"));
        assert_eq!(registry.online_ids("worker"), vec!["w-1"]);
    }

    #[test]
    fn test_type_change_moves_id() {
        let mut registry = Registry::new();
        registry.add(worker("n-1"));
        registry.add(ServerInfo::new("n-1", "127.0.0.1", 4000, "gate"));

        assert!(registry.online_ids("worker").is_empty());
        assert_eq!(registry.online_ids("gate"), vec!["n-1"]);
    }

    #[test]
    fn test_replace_resets_membership() {
        let mut registry = Registry::new();
        registry.add(worker("w-1"));
        registry.add(worker("w-2"));

        registry.replace(vec![worker("w-3").with_weight(2)]);

        assert_eq!(registry.online_ids("worker"), vec!["w-3"]);
        assert!(!registry.is_online("w-1"));
        assert!(registry.get("w-1").is_some());
        assert_eq!(registry.weight("w-3"), Some(2));
    }

    #[test]
    fn test_server_info_json_keys() {
        let info: ServerInfo = serde_json::from_str(
            r#"{"id": "chat-1", "host": "10.0.0.5", "port": 3051, "serverType": "chat", "weight": 3}"#,
        )
        .unwrap();
        assert_eq!(info.server_type, "chat");
        assert_eq!(info.weight, Some(3));
        assert_eq!(info.addr(), "10.0.0.5:3051");
    }
}
