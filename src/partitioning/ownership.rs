//! Ownership oracle: which members own a key under a given view.

use crate::cluster::ClusterView;
use crate::partitioning::hashring::HashRing;
use crate::types::{EntryKey, NodeId, TopologyId};
use parking_lot::RwLock;
use std::sync::Arc;

/// Role of a node for a specific key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipRole {
    /// Sequences writes and coordinates replication.
    Primary,
    /// Holds a replica.
    Backup,
    /// Should not hold the key.
    None,
}

impl OwnershipRole {
    /// Role of `node` in an owner list, primary first.
    pub fn of(node: NodeId, owners: &[NodeId]) -> Self {
        match owners.iter().position(|&o| o == node) {
            Some(0) => OwnershipRole::Primary,
            Some(_) => OwnershipRole::Backup,
            None => OwnershipRole::None,
        }
    }
}

/// Maps a key and a view to its ordered owner list.
///
/// Implementations must be deterministic: every node computing owners for the
/// same key and view gets the same list.
pub trait OwnershipOracle: Send + Sync + 'static {
    /// Owners of `key` under `view`, primary first.
    fn owners(&self, key: &EntryKey, view: &ClusterView) -> Vec<NodeId>;

    /// Primary owner of `key` under `view`.
    fn primary(&self, key: &EntryKey, view: &ClusterView) -> Option<NodeId> {
        self.owners(key, view).first().copied()
    }

    /// Role of `node` for `key` under `view`.
    fn role(&self, key: &EntryKey, view: &ClusterView, node: NodeId) -> OwnershipRole {
        OwnershipRole::of(node, &self.owners(key, view))
    }
}

/// Consistent-hash oracle; the ring for the latest view is cached.
pub struct ConsistentHashOracle {
    num_owners: usize,
    vnodes_per_node: usize,
    cached: RwLock<Option<(TopologyId, Vec<NodeId>, Arc<HashRing>)>>,
}

impl ConsistentHashOracle {
    /// Create an oracle placing `num_owners` copies of each key.
    pub fn new(num_owners: usize, vnodes_per_node: usize) -> Self {
        Self {
            num_owners: num_owners.max(1),
            vnodes_per_node,
            cached: RwLock::new(None),
        }
    }

    /// Copies per key.
    pub fn num_owners(&self) -> usize {
        self.num_owners
    }

    fn ring_for(&self, view: &ClusterView) -> Arc<HashRing> {
        if let Some((topology, members, ring)) = self.cached.read().as_ref() {
            if *topology == view.topology_id && *members == view.members {
                return ring.clone();
            }
        }

        let ring = Arc::new(HashRing::new(&view.members, self.vnodes_per_node));
        *self.cached.write() = Some((view.topology_id, view.members.clone(), ring.clone()));
        ring
    }
}

impl OwnershipOracle for ConsistentHashOracle {
    fn owners(&self, key: &EntryKey, view: &ClusterView) -> Vec<NodeId> {
        self.ring_for(view).owners(key, self.num_owners)
    }
}

impl std::fmt::Debug for ConsistentHashOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistentHashOracle")
            .field("num_owners", &self.num_owners)
            .field("vnodes_per_node", &self.vnodes_per_node)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_count_is_capped_by_members() {
        let oracle = ConsistentHashOracle::new(3, 32);
        let key = EntryKey::new("c", b"k".to_vec());

        let view = ClusterView::new(1, vec![1, 2]);
        assert_eq!(oracle.owners(&key, &view).len(), 2);

        let view = ClusterView::new(2, vec![1, 2, 3, 4]);
        assert_eq!(oracle.owners(&key, &view).len(), 3);
    }

    #[test]
    fn test_roles() {
        let oracle = ConsistentHashOracle::new(2, 32);
        let key = EntryKey::new("c", b"k".to_vec());
        let view = ClusterView::new(1, vec![1, 2, 3]);
        let owners = oracle.owners(&key, &view);

        assert_eq!(
            oracle.role(&key, &view, owners[0]),
            OwnershipRole::Primary
        );
        assert_eq!(oracle.role(&key, &view, owners[1]), OwnershipRole::Backup);
        let outsider = view
            .members
            .iter()
            .copied()
            .find(|m| !owners.contains(m))
            .unwrap();
        assert_eq!(oracle.role(&key, &view, outsider), OwnershipRole::None);
    }

    #[test]
    fn test_ring_follows_view_changes() {
        let oracle = ConsistentHashOracle::new(1, 32);
        let key = EntryKey::new("c", b"k".to_vec());

        assert_eq!(oracle.primary(&key, &ClusterView::new(1, vec![5])), Some(5));
        assert_eq!(oracle.primary(&key, &ClusterView::new(2, vec![7])), Some(7));
        assert_eq!(oracle.primary(&key, &ClusterView::new(2, Vec::new())), None);
    }
}
