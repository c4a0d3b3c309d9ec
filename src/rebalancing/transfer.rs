//! Planning of state transfer batches.

use crate::network::rpc::KeySnapshot;
use crate::types::{EntryKey, NodeId};
use std::collections::BTreeMap;

/// Entries per `StateTransfer` message.
pub const TRANSFER_BATCH_SIZE: usize = 512;

/// A local copy together with its owners under the new view.
#[derive(Debug, Clone)]
pub struct OwnedCopy {
    /// The copy, tombstones included.
    pub snapshot: KeySnapshot,
    /// Owners under the installed view, primary first.
    pub owners: Vec<NodeId>,
}

/// What one node has to push after a view change.
#[derive(Debug, Default)]
pub struct TransferPlan {
    /// Copies to push, per target owner.
    pub targets: BTreeMap<NodeId, Vec<KeySnapshot>>,
    /// Copies this node no longer owns; dropped once every owner received them.
    pub release: BTreeMap<EntryKey, Vec<NodeId>>,
}

impl TransferPlan {
    /// Plan the transfer of `copies` held by `node_id`.
    ///
    /// Every copy is pushed to every other owner: the receiver keeps it only
    /// if it is newer than its own, so owners that already hold the key are
    /// unaffected.
    pub fn build(node_id: NodeId, copies: impl IntoIterator<Item = OwnedCopy>) -> Self {
        let mut plan = Self::default();
        for OwnedCopy { snapshot, owners } in copies {
            if snapshot.version.is_none() {
                continue;
            }
            let targets: Vec<NodeId> = owners.iter().copied().filter(|&n| n != node_id).collect();
            if !owners.contains(&node_id) {
                plan.release.insert(snapshot.key.clone(), targets.clone());
            }
            for target in targets {
                plan.targets.entry(target).or_default().push(snapshot.clone());
            }
        }
        plan
    }

    /// Number of entries to push.
    pub fn len(&self) -> usize {
        self.targets.values().map(Vec::len).sum()
    }

    /// Whether nothing needs to move.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty() && self.release.is_empty()
    }

    /// Batches for one target.
    pub fn batches(entries: &[KeySnapshot]) -> impl Iterator<Item = &[KeySnapshot]> {
        entries.chunks(TRANSFER_BATCH_SIZE)
    }
}
