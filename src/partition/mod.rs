//! Partition Monitor.
//!
//! Tracks the installed view, classifies the local partition after members
//! leave, and detects the view change that reunites split partitions. The
//! monitor's view is the topology authority of the node: the dispatcher
//! compares command topologies against it and resolves owners with it.

pub mod merge;
pub mod policy;

use crate::cluster::{ClusterView, ViewChange};
use crate::config::{PartitionConfig, PartitionHandling};
use crate::error::{Error, Result};
use crate::types::{CommandFlags, NodeId, TopologyId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub use merge::{ConflictEntry, MergeCoordinator, MergeReport, PartitionCopy};
pub use policy::{MergePolicy, MergePolicyConfig, Resolution};

/// Availability state of the local partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionState {
    /// Every member of the last merged view is present.
    Stable,
    /// Members left; reads and writes are still served.
    Degraded,
    /// Members left; operations are rejected per the handling strategy.
    Unavailable,
    /// Split partitions rejoined and conflicts are being resolved.
    Merging,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionState::Stable => "STABLE",
            PartitionState::Degraded => "DEGRADED",
            PartitionState::Unavailable => "UNAVAILABLE",
            PartitionState::Merging => "MERGING",
        };
        f.write_str(s)
    }
}

/// What a view change did to the local partition.
#[derive(Debug, Clone)]
pub struct ViewTransition {
    /// Membership difference.
    pub change: ViewChange,
    /// State before the change.
    pub previous_state: PartitionState,
    /// State after the change.
    pub state: PartitionState,
    /// Generation of the merged view, while merging.
    pub merge_generation: Option<TopologyId>,
}

impl ViewTransition {
    /// Whether a merge must be (re)started for the new view.
    pub fn needs_merge(&self) -> bool {
        self.state == PartitionState::Merging
    }
}

#[derive(Debug)]
struct MonitorInner {
    view: ClusterView,
    state: PartitionState,
    split_generation: Option<TopologyId>,
    merge_generation: Option<TopologyId>,
    pre_merge_partition: Vec<NodeId>,
}

/// Per-node partition state machine.
pub struct PartitionMonitor {
    node_id: NodeId,
    handling: PartitionHandling,
    merge_wait_timeout: Duration,
    inner: RwLock<MonitorInner>,
    state_tx: watch::Sender<PartitionState>,
}

impl PartitionMonitor {
    /// Create a monitor with the initial view.
    pub fn new(node_id: NodeId, config: &PartitionConfig, view: ClusterView) -> Self {
        let (state_tx, _) = watch::channel(PartitionState::Stable);
        Self {
            node_id,
            handling: config.handling,
            merge_wait_timeout: config.merge_wait_timeout,
            inner: RwLock::new(MonitorInner {
                view,
                state: PartitionState::Stable,
                split_generation: None,
                merge_generation: None,
                pre_merge_partition: Vec::new(),
            }),
            state_tx,
        }
    }

    /// The installed view.
    pub fn view(&self) -> ClusterView {
        self.inner.read().view.clone()
    }

    /// Topology of the installed view.
    pub fn topology_id(&self) -> TopologyId {
        self.inner.read().view.topology_id
    }

    /// Current state.
    pub fn state(&self) -> PartitionState {
        self.inner.read().state
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<PartitionState> {
        self.state_tx.subscribe()
    }

    /// Generation of the first view installed after the split.
    pub fn split_generation(&self) -> Option<TopologyId> {
        self.inner.read().split_generation
    }

    /// Generation of the view that started the current merge.
    pub fn merge_generation(&self) -> Option<TopologyId> {
        self.inner.read().merge_generation
    }

    /// Members of this node's partition: the pre-merge side while merging,
    /// the installed view otherwise.
    pub fn partition_members(&self) -> Vec<NodeId> {
        let inner = self.inner.read();
        match inner.state {
            PartitionState::Merging => inner.pre_merge_partition.clone(),
            _ => inner.view.members.clone(),
        }
    }

    /// Install a newer view and classify the partition.
    ///
    /// Returns `None` when the view is not newer than the installed one.
    pub fn on_view_change(&self, view: ClusterView) -> Option<ViewTransition> {
        let mut inner = self.inner.write();
        if view.topology_id <= inner.view.topology_id {
            return None;
        }

        let change = ViewChange::between(&inner.view, &view);
        change.log(self.node_id);
        let previous_state = inner.state;
        let split = inner.split_generation.is_some()
            || matches!(
                previous_state,
                PartitionState::Degraded | PartitionState::Unavailable
            );

        inner.view = view.clone();

        if previous_state == PartitionState::Merging {
            // The merge restarts under the new view with the same generation.
            warn!(
                node_id = self.node_id,
                topology_id = view.topology_id,
                "View changed during merge"
            );
        } else if change.has_arrivals() && split {
            inner.state = PartitionState::Merging;
            inner.merge_generation = Some(view.topology_id);
            inner.pre_merge_partition = change.previous.members.clone();
            info!(
                node_id = self.node_id,
                topology_id = view.topology_id,
                partition = ?inner.pre_merge_partition,
                "Partitions rejoined, merging"
            );
        } else if change.has_departures() {
            if inner.split_generation.is_none() {
                inner.split_generation = Some(view.topology_id);
            }
            inner.state = match self.handling {
                PartitionHandling::PreferAvailability => PartitionState::Degraded,
                PartitionHandling::DenyReadWrites | PartitionHandling::AllowReads => {
                    PartitionState::Unavailable
                }
            };
            warn!(
                node_id = self.node_id,
                topology_id = view.topology_id,
                state = %inner.state,
                split_generation = ?inner.split_generation,
                "Partition lost members"
            );
        }

        let state = inner.state;
        let merge_generation = inner.merge_generation;
        drop(inner);
        self.state_tx.send_replace(state);

        Some(ViewTransition {
            change,
            previous_state,
            state,
            merge_generation,
        })
    }

    /// Finish the merge started at `merge_generation`.
    pub fn complete_merge(&self, merge_generation: TopologyId) -> bool {
        let mut inner = self.inner.write();
        if inner.state != PartitionState::Merging {
            return false;
        }
        if inner.merge_generation.map_or(false, |g| merge_generation < g) {
            return false;
        }

        inner.state = PartitionState::Stable;
        inner.split_generation = None;
        inner.merge_generation = None;
        inner.pre_merge_partition.clear();
        drop(inner);

        info!(node_id = self.node_id, merge_generation, "Merge complete");
        self.state_tx.send_replace(PartitionState::Stable);
        true
    }

    /// Return a degraded or unavailable partition to service.
    ///
    /// The split generation is kept so the next reunion still merges.
    pub fn force_available(&self) -> bool {
        let mut inner = self.inner.write();
        if !matches!(
            inner.state,
            PartitionState::Degraded | PartitionState::Unavailable
        ) {
            return false;
        }
        inner.state = PartitionState::Stable;
        drop(inner);

        warn!(node_id = self.node_id, "Partition forced available");
        self.state_tx.send_replace(PartitionState::Stable);
        true
    }

    /// Reject writes while unavailable.
    pub fn check_write(&self) -> Result<()> {
        match self.state() {
            PartitionState::Unavailable => Err(Error::Availability {
                state: PartitionState::Unavailable,
            }),
            _ => Ok(()),
        }
    }

    /// Reject reads while unavailable under `DenyReadWrites`.
    pub fn check_read(&self) -> Result<()> {
        match (self.state(), self.handling) {
            (PartitionState::Unavailable, PartitionHandling::DenyReadWrites) => {
                Err(Error::Availability {
                    state: PartitionState::Unavailable,
                })
            }
            _ => Ok(()),
        }
    }

    /// Admit a write, suspending ordinary writes while merging.
    pub async fn admit_write(&self, flags: CommandFlags) -> Result<()> {
        if flags.merge_resolution {
            return Ok(());
        }

        let mut rx = self.state_tx.subscribe();
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    PartitionState::Merging => {
                        if rx.changed().await.is_err() {
                            return Err(Error::Cancelled);
                        }
                    }
                    PartitionState::Unavailable => {
                        return Err(Error::Availability { state });
                    }
                    PartitionState::Stable | PartitionState::Degraded => return Ok(()),
                }
            }
        };

        match tokio::time::timeout(self.merge_wait_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::Availability {
                state: PartitionState::Merging,
            }),
        }
    }
}

impl fmt::Debug for PartitionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionMonitor")
            .field("node_id", &self.node_id)
            .field("handling", &self.handling)
            .field("inner", &*self.inner.read())
            .finish()
    }
}
