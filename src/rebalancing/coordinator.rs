//! State transfer after a view change.

use crate::cache::context::NodeContext;
use crate::error::{DistributionError, Error, NetworkError, Result};
use crate::network::rpc::{KeySnapshot, Message, StateTransfer};
use crate::partition::PartitionState;
use crate::rebalancing::transfer::{OwnedCopy, TransferPlan};
use crate::types::{NodeId, TopologyId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one state transfer round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Topology the transfer was computed in.
    pub topology_id: TopologyId,
    /// Entries pushed and acknowledged.
    pub pushed: usize,
    /// Local copies dropped after their new owners received them.
    pub released: usize,
    /// Targets that could not be reached.
    pub failed_targets: Vec<NodeId>,
    /// Versions of settled removals forgotten.
    pub pruned: usize,
}

/// Pushes copies to owners that gained them and installs copies pushed here.
pub struct StateTransferCoordinator {
    ctx: Arc<NodeContext>,
    round: tokio::sync::Mutex<()>,
}

impl StateTransferCoordinator {
    /// Create a coordinator.
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self {
            ctx,
            round: tokio::sync::Mutex::new(()),
        }
    }

    /// Push every local copy to its owners under the installed view.
    ///
    /// Skipped while merging: partitions still diverge and the merge decides
    /// which copies survive.
    pub async fn rebalance(&self) -> Result<TransferReport> {
        let _round = self.round.lock().await;
        let ctx = &self.ctx;
        let view = ctx.monitor.view();
        let mut report = TransferReport {
            topology_id: view.topology_id,
            ..Default::default()
        };
        if ctx.monitor.state() == PartitionState::Merging {
            debug!(node_id = ctx.node_id, "Merging, state transfer deferred");
            return Ok(report);
        }

        let mut copies = Vec::new();
        for key in ctx.versions.keys() {
            let snapshot = ctx.snapshot(&key).await?;
            let owners = ctx.oracle.owners(&key, &view);
            copies.push(OwnedCopy { snapshot, owners });
        }
        let plan = TransferPlan::build(ctx.node_id, copies);
        if plan.is_empty() {
            report.pruned = self.prune_tombstones(view.topology_id).await?;
            return Ok(report);
        }

        info!(
            node_id = ctx.node_id,
            topology_id = view.topology_id,
            targets = plan.targets.len(),
            entries = plan.len(),
            "Starting state transfer"
        );

        let mut failed: HashSet<NodeId> = HashSet::new();
        for (&target, entries) in &plan.targets {
            for batch in TransferPlan::batches(entries) {
                match self.push_batch(target, batch, view.topology_id).await {
                    Ok(()) => report.pushed += batch.len(),
                    Err(e) => {
                        warn!(node_id = ctx.node_id, target, error = %e, "State transfer failed");
                        failed.insert(target);
                        break;
                    }
                }
            }
        }

        for (key, targets) in &plan.release {
            // A newer view may have handed the key back.
            let (_, owners) = ctx.owners(key);
            if owners.contains(&ctx.node_id) {
                continue;
            }
            if targets.iter().any(|t| failed.contains(t)) {
                continue;
            }
            ctx.discard_copy(key).await?;
            report.released += 1;
        }

        ctx.metrics.entries_transferred.inc_by(report.pushed as u64);
        if failed.is_empty() {
            report.pruned = self.prune_tombstones(view.topology_id).await?;
        }
        report.failed_targets = failed.into_iter().collect();
        report.failed_targets.sort_unstable();
        info!(
            node_id = ctx.node_id,
            topology_id = view.topology_id,
            pushed = report.pushed,
            released = report.released,
            pruned = report.pruned,
            failed = ?report.failed_targets,
            "State transfer finished"
        );
        Ok(report)
    }

    /// Forget the versions of removals sequenced before `topology_id`, once
    /// every owner has been brought up to date.
    async fn prune_tombstones(&self, topology_id: TopologyId) -> Result<usize> {
        let ctx = &self.ctx;
        let mut pruned = 0;
        for key in ctx.versions.older_than(topology_id) {
            if ctx.prune_tombstone(&key).await? {
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!(node_id = ctx.node_id, topology_id, pruned, "Pruned settled removals");
        }
        Ok(pruned)
    }

    /// Push one batch, retrying while the target has not installed the view.
    async fn push_batch(
        &self,
        target: NodeId,
        batch: &[KeySnapshot],
        topology_id: TopologyId,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let retry = &ctx.config.replication.retry;
        let timeout = ctx.config.replication.backup_timeout;
        let mut attempt = 1;
        loop {
            let msg = Message::StateTransfer(StateTransfer {
                topology_id,
                entries: batch.to_vec(),
            });
            let err = match tokio::time::timeout(timeout, ctx.transport.request(target, msg)).await
            {
                Ok(Ok(Message::StateTransferReply(Ok(_)))) => return Ok(()),
                Ok(Ok(Message::StateTransferReply(Err(failure)))) => Error::from(failure),
                Ok(Ok(other)) => NetworkError::UnexpectedReply(other.name().to_string()).into(),
                Ok(Err(e)) => e,
                Err(_) => Error::Timeout,
            };
            if !err.is_transient() || attempt >= retry.max_attempts {
                return Err(err);
            }
            tokio::time::sleep(retry.backoff(attempt)).await;
            attempt += 1;
        }
    }

    /// Install copies pushed by another node.
    pub async fn handle_transfer(&self, transfer: StateTransfer) -> Result<usize> {
        let ctx = &self.ctx;
        let local = ctx.monitor.topology_id();
        if transfer.topology_id > local {
            return Err(DistributionError::TopologyAhead {
                command: transfer.topology_id,
                current: local,
            }
            .into());
        }

        let mut installed = 0;
        for snapshot in transfer.entries {
            let (_, owners) = ctx.owners(&snapshot.key);
            if !owners.contains(&ctx.node_id) {
                continue;
            }
            if ctx.install_copy(snapshot, owners).await? {
                installed += 1;
            }
        }
        debug!(
            node_id = ctx.node_id,
            topology_id = transfer.topology_id,
            installed,
            "Installed transferred entries"
        );
        Ok(installed)
    }
}

impl std::fmt::Debug for StateTransferCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTransferCoordinator")
            .field("node_id", &self.ctx.node_id)
            .finish()
    }
}
