//! Consistent hashing with virtual nodes.
//!
//! Each member is placed on the ring `vnodes_per_node` times. The owners of a
//! key are the first distinct members found walking clockwise from the key's
//! hash, so the ring built from the same member list always yields the same
//! owners on every node.

use crate::types::{EntryKey, NodeId};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// A consistent hash ring over a fixed member list.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Ring position to member.
    vnodes: BTreeMap<u64, NodeId>,

    /// Members placed on the ring, sorted.
    nodes: Vec<NodeId>,

    vnodes_per_node: usize,
}

impl HashRing {
    /// Build a ring for the given members.
    pub fn new(members: &[NodeId], vnodes_per_node: usize) -> Self {
        let mut ring = Self {
            vnodes: BTreeMap::new(),
            nodes: Vec::with_capacity(members.len()),
            vnodes_per_node: vnodes_per_node.max(1),
        };
        for &node in members {
            ring.add_node(node);
        }
        ring
    }

    /// Members on the ring.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Whether the ring has no members.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn add_node(&mut self, node_id: NodeId) {
        if self.nodes.contains(&node_id) {
            return;
        }
        self.nodes.push(node_id);
        self.nodes.sort_unstable();

        for i in 0..self.vnodes_per_node {
            let vnode_key = format!("{}:{}", node_id, i);
            let hash = hash_bytes(vnode_key.as_bytes());
            // Collisions resolve to the lower id on every node.
            self.vnodes
                .entry(hash)
                .and_modify(|owner| *owner = (*owner).min(node_id))
                .or_insert(node_id);
        }
    }

    /// Up to `count` distinct owners of a key, primary first.
    pub fn owners(&self, key: &EntryKey, count: usize) -> Vec<NodeId> {
        if self.vnodes.is_empty() || count == 0 {
            return Vec::new();
        }

        let hash = hash_key(key);
        let wanted = count.min(self.nodes.len());
        let mut owners = Vec::with_capacity(wanted);

        let walk = self.vnodes.range(hash..).chain(self.vnodes.range(..hash));
        for (_, &node_id) in walk {
            if !owners.contains(&node_id) {
                owners.push(node_id);
                if owners.len() >= wanted {
                    break;
                }
            }
        }

        owners
    }

    /// The primary owner of a key.
    pub fn primary(&self, key: &EntryKey) -> Option<NodeId> {
        self.owners(key, 1).into_iter().next()
    }
}

/// Hash an entry key: cache name and key bytes both take part.
pub fn hash_key(key: &EntryKey) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    key.cache.hash(&mut hasher);
    key.key.as_ref().hash(&mut hasher);
    hasher.finish()
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    bytes.hash(&mut hasher);
    hasher.finish()
}
