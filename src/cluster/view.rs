//! Cluster views and the membership provider seam.
//!
//! A view is the ordered member list a node currently believes in, stamped
//! with the topology generation assigned by the membership layer. Members are
//! kept sorted by id, which is the stable ordering used for coordinator
//! election.

use crate::types::{NodeId, TopologyId};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Membership snapshot installed on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    /// Topology generation of this view.
    pub topology_id: TopologyId,
    /// Members, sorted ascending by id.
    pub members: Vec<NodeId>,
}

impl ClusterView {
    /// Create a view; members are sorted and deduplicated.
    pub fn new(topology_id: TopologyId, members: impl IntoIterator<Item = NodeId>) -> Self {
        let mut members: Vec<NodeId> = members.into_iter().collect();
        members.sort_unstable();
        members.dedup();
        Self {
            topology_id,
            members,
        }
    }

    /// Whether the node is a member.
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.members.binary_search(&node_id).is_ok()
    }

    /// The member ranked lowest, which coordinates merges.
    pub fn coordinator(&self) -> Option<NodeId> {
        self.members.first().copied()
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

/// Source of cluster views for one node.
pub trait MembershipProvider: Send + Sync + 'static {
    /// The most recent view.
    fn current_view(&self) -> ClusterView;

    /// Subscribe to view changes. Every installed view is delivered in order.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterView>;
}

/// Membership provider driven explicitly by the embedding application or tests.
pub struct StaticMembership {
    view: RwLock<ClusterView>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ClusterView>>>,
}

impl StaticMembership {
    /// Create a provider with an initial view.
    pub fn new(initial: ClusterView) -> Arc<Self> {
        Arc::new(Self {
            view: RwLock::new(initial),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Install a new view and notify subscribers.
    ///
    /// Views whose topology is not newer than the current one are ignored.
    pub fn install(&self, view: ClusterView) -> bool {
        {
            let mut current = self.view.write();
            if view.topology_id <= current.topology_id {
                debug!(
                    current = current.topology_id,
                    offered = view.topology_id,
                    "Ignoring view that is not newer"
                );
                return false;
            }
            *current = view.clone();
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(view.clone()).is_ok());
        true
    }
}

impl MembershipProvider for StaticMembership {
    fn current_view(&self) -> ClusterView {
        self.view.read().clone()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterView> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

impl std::fmt::Debug for StaticMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticMembership")
            .field("view", &*self.view.read())
            .finish()
    }
}
