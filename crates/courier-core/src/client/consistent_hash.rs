//! Consistent-hash ring with virtual replicas.
//!
//! Every node owns `replicas` points on a 64-bit ring, placed at the hash of
//! `"{node}:{i}"`. A key maps to the owner of the first point at or after
//! its own hash, wrapping to the lowest point.

use super::registry::{MembershipEvent, MembershipListener};
use crate::config::HashAlgorithm;
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

impl HashAlgorithm {
    /// Ring position of `input`: the first eight digest bytes, big-endian.
    pub fn hash_key(&self, input: &str) -> u64 {
        let mut prefix = [0u8; 8];
        match self {
            HashAlgorithm::Md5 => prefix.copy_from_slice(&md5::compute(input.as_bytes()).0[..8]),
            HashAlgorithm::Sha256 => prefix.copy_from_slice(&Sha256::digest(input.as_bytes())[..8]),
            HashAlgorithm::Sha512 => prefix.copy_from_slice(&Sha512::digest(input.as_bytes())[..8]),
            HashAlgorithm::Blake3 => prefix.copy_from_slice(&blake3::hash(input.as_bytes()).as_bytes()[..8]),
        }
        u64::from_be_bytes(prefix)
    }
}

#[derive(Debug, Default)]
struct Ring {
    owners: HashMap<u64, String>,
    /// Always sorted ascending; every key has an entry in `owners`.
    keys: Vec<u64>,
    nodes: Vec<String>,
}

/// Ring for one server type.
///
/// Registered with the station as a [`MembershipListener`], it follows
/// add/remove events for its own server type.
#[derive(Debug)]
pub struct ConsistentHash {
    server_type: String,
    replicas: usize,
    algorithm: HashAlgorithm,
    ring: RwLock<Ring>,
}

impl ConsistentHash {
    /// Build a ring for `server_type` with `replicas` points per node.
    pub fn new<I, S>(
        server_type: impl Into<String>,
        nodes: I,
        replicas: usize,
        algorithm: HashAlgorithm,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ring = Self {
            server_type: server_type.into(),
            replicas,
            algorithm,
            ring: RwLock::new(Ring::default()),
        };
        for node in nodes {
            ring.add_node(node.as_ref());
        }
        ring
    }

    /// Server type whose membership events this ring follows.
    pub fn server_type(&self) -> &str {
        &self.server_type
    }

    /// Place a node's replicas on the ring. Adding a present node is a no-op.
    pub fn add_node(&self, node: &str) {
        let mut ring = self.write();
        if ring.nodes.iter().any(|n| n == node) {
            return;
        }
        ring.nodes.push(node.to_string());
        for i in 0..self.replicas {
            let key = self.algorithm.hash_key(&format!("{}:{}", node, i));
            if !ring.owners.contains_key(&key) {
                ring.owners.insert(key, node.to_string());
                ring.keys.push(key);
            }
        }
        ring.keys.sort_unstable();
        debug!("ring {} added node {}", self.server_type, node);
    }

    /// Take a node's points off the ring. Unknown nodes are ignored.
    pub fn remove_node(&self, node: &str) {
        let mut ring = self.write();
        if !ring.nodes.iter().any(|n| n == node) {
            return;
        }
        ring.nodes.retain(|n| n != node);
        ring.owners.retain(|_, owner| owner != node);
        let Ring { owners, keys, .. } = &mut *ring;
        keys.retain(|key| owners.contains_key(key));
        debug!("ring {} removed node {}", self.server_type, node);
    }

    /// Owner of `key`, or `None` on an empty ring.
    pub fn get_node(&self, key: &str) -> Option<String> {
        self.get_node_by_hash(self.algorithm.hash_key(key))
    }

    fn get_node_by_hash(&self, hash: u64) -> Option<String> {
        let ring = self.read();
        if ring.keys.is_empty() {
            return None;
        }
        let idx = ring.keys.partition_point(|k| *k < hash);
        let point = ring.keys.get(idx).unwrap_or(&ring.keys[0]);
        ring.owners.get(point).cloned()
    }

    /// Nodes on the ring, in insertion order.
    pub fn nodes(&self) -> Vec<String> {
        self.read().nodes.clone()
    }

    /// Number of virtual points on the ring.
    pub fn points(&self) -> usize {
        self.read().keys.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, Ring> {
        self.ring.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Ring> {
        self.ring.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MembershipListener for ConsistentHash {
    fn on_membership(&self, event: &MembershipEvent) {
        match event {
            MembershipEvent::Added(server) if server.server_type == self.server_type => {
                self.add_node(&server.id);
            }
            MembershipEvent::Removed {
                server_id,
                server_type,
            } if server_type.as_deref().map_or(true, |t| t == self.server_type) => {
                self.remove_node(server_id);
            }
            _ => {}
        }
    }
}
