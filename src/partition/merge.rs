//! Merge Coordinator.
//!
//! Runs on the lowest member of a view that reunited split partitions. The
//! merge works in two rounds over the merged view:
//!
//! 1. every member lists the keys it touched since its split generation;
//! 2. every member returns its copy of each key in the union.
//!
//! Copies are grouped by the pre-merge partition of the member that reported
//! them, the newest copy per partition is kept, and keys whose partitions
//! disagree are handed to the [`MergePolicy`]. Resolutions are committed
//! through the dispatcher at the merged generation, so a restarted merge
//! recognises keys it already resolved and skips them.

use crate::cache::context::NodeContext;
use crate::dispatch::TriangleDispatcher;
use crate::error::{DistributionError, Error, NetworkError, Result};
use crate::network::rpc::{KeySnapshot, MergeComplete, Message, StateRequest, StateResponse};
use crate::partition::policy::{MergePolicy, Resolution};
use crate::partition::PartitionState;
use crate::types::{EntryKey, EntryMetadata, NodeId, TopologyId, Version, WriteCommand, WriteKind};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The newest copy of a key within one pre-merge partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCopy {
    /// Members of the partition, sorted.
    pub partition: Vec<NodeId>,
    /// Value, `None` if the partition removed the key.
    pub value: Option<Bytes>,
    /// Metadata of the value.
    pub metadata: EntryMetadata,
    /// Version of the copy.
    pub version: Version,
}

impl PartitionCopy {
    /// The resolution that adopts this copy.
    pub fn resolution(&self) -> Resolution {
        match &self.value {
            Some(value) => Resolution::Value {
                value: value.clone(),
                metadata: self.metadata,
            },
            None => Resolution::Tombstone,
        }
    }

    fn lowest_member(&self) -> NodeId {
        self.partition.iter().copied().min().unwrap_or(NodeId::MAX)
    }
}

/// Divergent copies of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntry {
    /// The key.
    pub key: EntryKey,
    /// Copies ordered by preference: larger partitions first, ties broken by
    /// the partition holding the lowest member id.
    pub copies: Vec<PartitionCopy>,
}

impl ConflictEntry {
    /// Create a conflict, ordering copies by partition preference.
    pub fn new(key: EntryKey, mut copies: Vec<PartitionCopy>) -> Self {
        copies.sort_by(|a, b| {
            b.partition
                .len()
                .cmp(&a.partition.len())
                .then_with(|| a.lowest_member().cmp(&b.lowest_member()))
        });
        Self { key, copies }
    }

    /// Copy of the preferred partition.
    pub fn preferred(&self) -> Option<&PartitionCopy> {
        self.copies.first()
    }
}

/// Outcome of one merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Generation of the merged view.
    pub merge_generation: TopologyId,
    /// Keys compared across partitions.
    pub keys_examined: usize,
    /// Keys resolved by an earlier attempt.
    pub already_resolved: usize,
    /// Keys whose partitions disagreed.
    pub conflicts: usize,
    /// Resolutions committed.
    pub resolved: usize,
    /// View the merge ran under.
    pub topology_id: TopologyId,
    /// Members that did not acknowledge the completion.
    pub undelivered: Vec<NodeId>,
}

/// Detects and resolves divergence after partitions rejoin.
pub struct MergeCoordinator {
    ctx: Arc<NodeContext>,
    dispatcher: Arc<TriangleDispatcher>,
    policy: Arc<dyn MergePolicy>,
}

impl MergeCoordinator {
    /// Create a coordinator using the configured merge policy.
    pub fn new(ctx: Arc<NodeContext>, dispatcher: Arc<TriangleDispatcher>) -> Self {
        let policy = ctx.config.partition.merge_policy.build();
        Self {
            ctx,
            dispatcher,
            policy,
        }
    }

    /// Run the merge until it completes, the attempts run out, or another
    /// view supersedes it.
    pub async fn run_with_attempts(&self, merge_generation: TopologyId) -> Result<MergeReport> {
        let attempts = self.ctx.config.partition.merge_attempts.max(1);
        let retry = &self.ctx.config.replication.retry;
        let topology_id = self.ctx.monitor.topology_id();
        let mut attempt = 1;
        loop {
            match self.run(merge_generation).await {
                Ok(report) => return Ok(report),
                Err(e)
                    if attempt < attempts
                        && self.still_coordinating(merge_generation, topology_id) =>
                {
                    warn!(
                        node_id = self.ctx.node_id,
                        merge_generation,
                        attempt,
                        error = %e,
                        "Merge attempt failed, retrying"
                    );
                    tokio::time::sleep(retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether this node still coordinates the merge of `merge_generation`
    /// under the view `topology_id`.
    pub fn still_coordinating(&self, merge_generation: TopologyId, topology_id: TopologyId) -> bool {
        let monitor = &self.ctx.monitor;
        let view = monitor.view();
        monitor.state() == PartitionState::Merging
            && monitor.merge_generation() == Some(merge_generation)
            && view.topology_id == topology_id
            && view.coordinator() == Some(self.ctx.node_id)
    }

    /// One merge attempt over the installed view.
    pub async fn run(&self, merge_generation: TopologyId) -> Result<MergeReport> {
        let view = self.ctx.monitor.view();
        info!(
            node_id = self.ctx.node_id,
            merge_generation,
            topology_id = view.topology_id,
            members = ?view.members,
            policy = self.policy.name(),
            "Starting merge"
        );

        let listing = self
            .collect(&view.members, StateRequest {
                merge_generation,
                keys: None,
            })
            .await?;
        let keys: BTreeSet<EntryKey> = listing.into_iter().flat_map(|r| r.keys).collect();

        let mut report = MergeReport {
            merge_generation,
            topology_id: view.topology_id,
            keys_examined: keys.len(),
            ..Default::default()
        };

        if !keys.is_empty() {
            let responses = self
                .collect(&view.members, StateRequest {
                    merge_generation,
                    keys: Some(keys.into_iter().collect()),
                })
                .await?;

            for (key, copies) in group_copies(responses) {
                if copies.iter().any(|c| c.version.generation >= merge_generation) {
                    report.already_resolved += 1;
                    continue;
                }
                if !diverges(&copies) {
                    continue;
                }

                let conflict = ConflictEntry::new(key, copies);
                report.conflicts += 1;
                self.ctx.metrics.conflicts_detected.inc();
                self.resolve(&conflict).await?;
                report.resolved += 1;
                self.ctx.metrics.conflicts_resolved.inc();
            }
        }

        let others: Vec<NodeId> = view
            .members
            .iter()
            .copied()
            .filter(|&member| member != self.ctx.node_id)
            .collect();
        report.undelivered = self.broadcast_complete(&others, merge_generation).await;

        info!(
            node_id = self.ctx.node_id,
            merge_generation,
            keys = report.keys_examined,
            conflicts = report.conflicts,
            resolved = report.resolved,
            undelivered = ?report.undelivered,
            "Merge finished"
        );
        Ok(report)
    }

    /// Resend the completion to the members that missed it, until each has
    /// acknowledged it or left the view.
    pub async fn redeliver_completion(&self, report: &MergeReport) {
        let retry = &self.ctx.config.replication.retry;
        let mut pending = report.undelivered.clone();
        let mut attempt = 1;
        while !pending.is_empty() {
            tokio::time::sleep(retry.backoff(attempt)).await;
            let view = self.ctx.monitor.view();
            pending.retain(|member| view.members.contains(member));
            if pending.is_empty() {
                break;
            }
            debug!(
                node_id = self.ctx.node_id,
                merge_generation = report.merge_generation,
                pending = ?pending,
                attempt,
                "Redelivering merge completion"
            );
            pending = self
                .broadcast_complete(&pending, report.merge_generation)
                .await;
            attempt = attempt.saturating_add(1);
        }
    }

    async fn collect(&self, members: &[NodeId], request: StateRequest) -> Result<Vec<StateResponse>> {
        let timeout = self.ctx.config.partition.state_request_timeout;
        let requests = members.iter().map(|&member| {
            let request = request.clone();
            async move {
                if member == self.ctx.node_id {
                    return self.handle_state_request(request).await;
                }
                let reply = tokio::time::timeout(
                    timeout,
                    self.ctx
                        .transport
                        .request(member, Message::StateRequest(request)),
                )
                .await
                .map_err(|_| Error::Timeout)??;
                match reply {
                    Message::StateResponse(result) => result.map_err(Error::from),
                    other => Err(NetworkError::UnexpectedReply(other.name().to_string()).into()),
                }
            }
        });

        futures::future::join_all(requests).await.into_iter().collect()
    }

    async fn resolve(&self, conflict: &ConflictEntry) -> Result<()> {
        let resolution = self.policy.resolve(conflict);
        debug!(
            node_id = self.ctx.node_id,
            key = %conflict.key,
            copies = conflict.copies.len(),
            resolution = ?resolution,
            "Resolving conflict"
        );

        let id = self.ctx.next_command_id();
        let cache = conflict.key.cache.clone();
        let command = match resolution {
            Resolution::Value { value, metadata } => {
                WriteCommand::new(id, cache, WriteKind::Put { value, metadata })
            }
            Resolution::Tombstone => WriteCommand::remove(id, cache),
        }
        .as_merge_resolution();

        self.dispatcher.submit(command, conflict.key.clone()).await?;
        Ok(())
    }

    /// Tell `members` the merge is complete. Returns the members that did
    /// not acknowledge.
    async fn broadcast_complete(&self, members: &[NodeId], merge_generation: TopologyId) -> Vec<NodeId> {
        let timeout = self.ctx.config.partition.state_request_timeout;
        let sends = members.iter().map(|&member| async move {
            let msg = Message::MergeComplete(MergeComplete { merge_generation });
            let result =
                tokio::time::timeout(timeout, self.ctx.transport.request(member, msg)).await;
            (member, result)
        });

        let mut undelivered = Vec::new();
        for (member, result) in futures::future::join_all(sends).await {
            match result {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => warn!(
                    node_id = self.ctx.node_id,
                    member,
                    error = %e,
                    "Failed to deliver merge completion"
                ),
                Err(_) => warn!(
                    node_id = self.ctx.node_id,
                    member,
                    "Merge completion timed out"
                ),
            }
            undelivered.push(member);
        }
        undelivered
    }

    /// Answer a state request from the merge coordinator.
    pub async fn handle_state_request(&self, request: StateRequest) -> Result<StateResponse> {
        let ctx = &self.ctx;
        let local = ctx.monitor.topology_id();
        if local < request.merge_generation {
            return Err(DistributionError::TopologyAhead {
                command: request.merge_generation,
                current: local,
            }
            .into());
        }

        let partition = ctx.monitor.partition_members();
        match request.keys {
            None => {
                let keys = match ctx.monitor.split_generation() {
                    Some(generation) => ctx.versions.touched_since(generation),
                    None => ctx.versions.keys(),
                };
                debug!(
                    node_id = ctx.node_id,
                    merge_generation = request.merge_generation,
                    keys = keys.len(),
                    "Listing divergent keys"
                );
                Ok(StateResponse {
                    responder: ctx.node_id,
                    partition,
                    keys,
                    snapshots: Vec::new(),
                })
            }
            Some(keys) => {
                let mut snapshots = Vec::with_capacity(keys.len());
                for key in &keys {
                    snapshots.push(ctx.snapshot(key).await?);
                }
                Ok(StateResponse {
                    responder: ctx.node_id,
                    partition,
                    keys: Vec::new(),
                    snapshots,
                })
            }
        }
    }
}

/// Newest copy of each key per reported partition.
///
/// A partition none of whose members holds the key gets a null copy, so a
/// key written on one side only still conflicts with the side that never
/// saw it.
fn group_copies(responses: Vec<StateResponse>) -> BTreeMap<EntryKey, Vec<PartitionCopy>> {
    let mut partitions: BTreeSet<Vec<NodeId>> = BTreeSet::new();
    let mut grouped: BTreeMap<EntryKey, BTreeMap<Vec<NodeId>, PartitionCopy>> = BTreeMap::new();

    for response in responses {
        let mut partition = response.partition;
        partition.sort_unstable();
        partitions.insert(partition.clone());
        for snapshot in response.snapshots {
            let KeySnapshot {
                key,
                value,
                metadata,
                version,
            } = snapshot;
            let copies = grouped.entry(key).or_default();
            // Never held by the responder.
            let Some(version) = version else { continue };

            let newer = copies
                .get(&partition)
                .map_or(true, |existing| version > existing.version);
            if newer {
                copies.insert(
                    partition.clone(),
                    PartitionCopy {
                        partition: partition.clone(),
                        value,
                        metadata,
                        version,
                    },
                );
            }
        }
    }

    grouped
        .into_iter()
        .map(|(key, mut copies)| {
            for partition in &partitions {
                copies
                    .entry(partition.clone())
                    .or_insert_with(|| PartitionCopy {
                        partition: partition.clone(),
                        value: None,
                        metadata: EntryMetadata::default(),
                        version: Version::default(),
                    });
            }
            (key, copies.into_values().collect())
        })
        .collect()
}

/// Whether the partitions hold different copies. A removed copy and a
/// missing one are the same null.
fn diverges(copies: &[PartitionCopy]) -> bool {
    copies
        .iter()
        .map(|c| c.value.as_ref().map(|value| (value, c.version)))
        .collect::<BTreeSet<_>>()
        .len()
        > 1
}

impl std::fmt::Debug for MergeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeCoordinator")
            .field("node_id", &self.ctx.node_id)
            .field("policy", &self.policy.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> EntryKey {
        EntryKey::new("c", b"k".to_vec())
    }

    fn snapshot(value: Option<&'static [u8]>, version: Option<Version>) -> KeySnapshot {
        KeySnapshot {
            key: key(),
            value: value.map(Bytes::from_static),
            metadata: EntryMetadata::default(),
            version,
        }
    }

    fn response(responder: NodeId, partition: Vec<NodeId>, snapshots: Vec<KeySnapshot>) -> StateResponse {
        StateResponse {
            responder,
            partition,
            keys: Vec::new(),
            snapshots,
        }
    }

    #[test]
    fn test_conflict_orders_by_partition_size_then_lowest_member() {
        let copy = |partition: Vec<NodeId>| PartitionCopy {
            partition,
            value: None,
            metadata: EntryMetadata::default(),
            version: Version::new(1, 1),
        };
        let conflict = ConflictEntry::new(key(), vec![copy(vec![5]), copy(vec![4, 6]), copy(vec![2, 3])]);

        let order: Vec<_> = conflict.copies.iter().map(|c| c.partition.clone()).collect();
        assert_eq!(order, vec![vec![2, 3], vec![4, 6], vec![5]]);
        assert_eq!(conflict.preferred().unwrap().partition, vec![2, 3]);
    }

    #[test]
    fn test_group_keeps_newest_copy_per_partition() {
        let grouped = group_copies(vec![
            response(1, vec![1, 2], vec![snapshot(Some(b"old"), Some(Version::new(2, 1)))]),
            response(2, vec![2, 1], vec![snapshot(Some(b"new"), Some(Version::new(2, 2)))]),
            response(3, vec![3], vec![snapshot(None, Some(Version::new(3, 1)))]),
            response(4, vec![4], vec![snapshot(None, None)]),
        ]);

        let copies = &grouped[&key()];
        assert_eq!(copies.len(), 3);
        let majority = copies.iter().find(|c| c.partition == vec![1, 2]).unwrap();
        assert_eq!(majority.value, Some(Bytes::from_static(b"new")));
        let unseen = copies.iter().find(|c| c.partition == vec![4]).unwrap();
        assert_eq!(unseen.value, None);
        assert_eq!(unseen.version, Version::default());
        assert!(diverges(copies));
    }

    #[test]
    fn test_partition_without_the_key_reports_null_copy() {
        // Written on [1, 2] only; [3] answered but never held the key.
        let grouped = group_copies(vec![
            response(1, vec![1, 2], vec![snapshot(Some(b"one-sided"), Some(Version::new(2, 1)))]),
            response(2, vec![1, 2], vec![snapshot(None, None)]),
            response(3, vec![3], vec![snapshot(None, None)]),
        ]);

        let conflict = ConflictEntry::new(key(), grouped[&key()].clone());
        assert!(diverges(&conflict.copies));
        assert_eq!(conflict.copies.len(), 2);
        assert_eq!(conflict.copies[1].partition, vec![3]);
        assert_eq!(conflict.copies[1].resolution(), Resolution::Tombstone);
    }

    #[test]
    fn test_removed_and_missing_copies_do_not_diverge() {
        let grouped = group_copies(vec![
            response(1, vec![1], vec![snapshot(None, Some(Version::new(2, 3)))]),
            response(2, vec![2], vec![snapshot(None, None)]),
        ]);
        assert_eq!(grouped[&key()].len(), 2);
        assert!(!diverges(&grouped[&key()]));
    }

    #[test]
    fn test_identical_copies_do_not_diverge() {
        let grouped = group_copies(vec![
            response(1, vec![1], vec![snapshot(Some(b"v"), Some(Version::new(1, 4)))]),
            response(2, vec![2], vec![snapshot(Some(b"v"), Some(Version::new(1, 4)))]),
        ]);
        assert!(!diverges(&grouped[&key()]));
    }

    #[test]
    fn test_resolution_of_removed_copy_is_tombstone() {
        let copy = PartitionCopy {
            partition: vec![1],
            value: None,
            metadata: EntryMetadata::default(),
            version: Version::new(1, 1),
        };
        assert_eq!(copy.resolution(), Resolution::Tombstone);
    }
}
