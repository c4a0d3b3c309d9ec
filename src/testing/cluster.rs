//! In-process cluster used by the scenario tests.

use super::utils::wait_for;
use crate::cluster::{ClusterView, StaticMembership};
use crate::config::{
    GridConfig, LockServiceConfig, PartitionConfig, ReplicationConfig, RetryConfig,
};
use crate::network::InMemoryNetwork;
use crate::partition::PartitionState;
use crate::types::{EntryKey, NodeId, TopologyId};
use crate::DataGrid;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// How long scenario waits may take before a test fails.
pub(crate) const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

const CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration with short timeouts and backoffs.
pub(crate) fn test_config(node_id: NodeId) -> GridConfig {
    GridConfig::new(node_id)
        .with_replication(
            ReplicationConfig::default()
                .with_backup_timeout(Duration::from_millis(500))
                .with_retry(RetryConfig {
                    max_attempts: 10,
                    initial_backoff: Duration::from_millis(5),
                    max_backoff: Duration::from_millis(100),
                }),
        )
        .with_partition(PartitionConfig {
            merge_wait_timeout: Duration::from_secs(3),
            state_request_timeout: Duration::from_secs(1),
            merge_attempts: 5,
            ..Default::default()
        })
        .with_locks(LockServiceConfig {
            recheck_interval: Duration::from_millis(50),
        })
}

/// One member of a [`TestCluster`].
pub(crate) struct TestNode {
    pub grid: DataGrid,
    pub membership: Arc<StaticMembership>,
}

/// A cluster of grid nodes over an [`InMemoryNetwork`].
///
/// Views are installed explicitly, one topology id per installation, so a
/// split gives each side its own id and the healed view exceeds both.
pub(crate) struct TestCluster {
    pub network: Arc<InMemoryNetwork>,
    nodes: BTreeMap<NodeId, TestNode>,
    crashed: BTreeSet<NodeId>,
    topology_id: TopologyId,
    configure: Arc<dyn Fn(GridConfig) -> GridConfig + Send + Sync>,
}

impl TestCluster {
    /// Start `node_count` nodes with ids `1..=node_count` and the test config.
    pub fn start(node_count: usize) -> Self {
        Self::start_with(node_count, |config| config)
    }

    /// Start nodes whose config is adjusted by `configure`.
    pub fn start_with<F>(node_count: usize, configure: F) -> Self
    where
        F: Fn(GridConfig) -> GridConfig + Send + Sync + 'static,
    {
        let mut cluster = Self {
            network: InMemoryNetwork::new(),
            nodes: BTreeMap::new(),
            crashed: BTreeSet::new(),
            topology_id: 1,
            configure: Arc::new(configure),
        };
        let view = ClusterView::new(1, 1..=node_count as NodeId);
        for node_id in view.members.clone() {
            cluster.spawn_node(node_id, view.clone());
        }
        info!(nodes = node_count, "Test cluster started");
        cluster
    }

    fn spawn_node(&mut self, node_id: NodeId, view: ClusterView) {
        let config = (self.configure)(test_config(node_id));
        let membership = StaticMembership::new(view);
        let grid = DataGrid::new(
            config,
            membership.clone(),
            self.network.transport(node_id),
        )
        .expect("valid test config");
        self.network.register(node_id, grid.message_handler());
        self.nodes.insert(node_id, TestNode { grid, membership });
    }

    /// The grid of a node.
    pub fn grid(&self, node_id: NodeId) -> &DataGrid {
        &self.nodes.get(&node_id).expect("node exists").grid
    }

    /// Ids of the nodes that have not crashed.
    pub fn alive(&self) -> Vec<NodeId> {
        self.nodes
            .keys()
            .copied()
            .filter(|id| !self.crashed.contains(id))
            .collect()
    }

    /// Last topology id handed out.
    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    /// Owners of a key as seen by the first live node.
    pub fn owners(&self, key: &EntryKey) -> Vec<NodeId> {
        let first = self.alive()[0];
        self.grid(first).owners(key)
    }

    /// First key of `cache` named `key-<n>` whose owners satisfy `predicate`.
    pub fn key_where<P>(&self, cache: &str, predicate: P) -> EntryKey
    where
        P: Fn(&[NodeId]) -> bool,
    {
        (0..10_000)
            .map(|i| EntryKey::new(cache, format!("key-{}", i)))
            .find(|key| predicate(&self.owners(key)))
            .expect("some key matches the ownership predicate")
    }

    /// Install a view of `members` on those members and wait until they run it.
    pub async fn install(&mut self, members: &[NodeId]) -> TopologyId {
        self.topology_id += 1;
        let view = ClusterView::new(self.topology_id, members.iter().copied());
        for member in members {
            if let Some(node) = self.nodes.get(member) {
                node.membership.install(view.clone());
            }
        }
        assert!(
            self.wait_for_topology(members, self.topology_id).await,
            "view {} not installed on {:?}",
            self.topology_id,
            members
        );
        self.topology_id
    }

    /// Cut the network between two sides and give each side its own view.
    pub async fn split(&mut self, side_a: &[NodeId], side_b: &[NodeId]) -> (TopologyId, TopologyId) {
        self.network.partition(side_a, side_b);
        let a = self.install(side_a).await;
        let b = self.install(side_b).await;
        info!(?side_a, ?side_b, a, b, "Cluster split");
        (a, b)
    }

    /// Reconnect every live node under one view.
    pub async fn heal(&mut self) -> TopologyId {
        self.network.heal();
        let alive = self.alive();
        let topology_id = self.install(&alive).await;
        info!(members = ?alive, topology_id, "Cluster healed");
        topology_id
    }

    /// Stop delivering to and from a node, without a view change.
    pub fn crash(&mut self, node_id: NodeId) {
        self.network.crash(node_id);
        self.crashed.insert(node_id);
    }

    /// Crash a node and install a view of the survivors.
    pub async fn crash_and_evict(&mut self, node_id: NodeId) -> TopologyId {
        self.crash(node_id);
        let alive = self.alive();
        self.install(&alive).await
    }

    /// Start a new node and install a view including it on every live node.
    pub async fn join(&mut self, node_id: NodeId) -> TopologyId {
        self.spawn_node(node_id, ClusterView::new(0, vec![node_id]));
        let alive = self.alive();
        self.install(&alive).await
    }

    /// Wait until every listed node runs `topology_id`.
    pub async fn wait_for_topology(&self, members: &[NodeId], topology_id: TopologyId) -> bool {
        wait_for(
            || {
                members
                    .iter()
                    .filter_map(|m| self.nodes.get(m))
                    .all(|n| n.grid.topology_id() == topology_id)
            },
            WAIT_TIMEOUT,
            CHECK_INTERVAL,
        )
        .await
    }

    /// Wait until every listed node is in `state`.
    pub async fn wait_for_state(&self, members: &[NodeId], state: PartitionState) -> bool {
        wait_for(
            || {
                members
                    .iter()
                    .filter_map(|m| self.nodes.get(m))
                    .all(|n| n.grid.partition_state() == state)
            },
            WAIT_TIMEOUT,
            CHECK_INTERVAL,
        )
        .await
    }

    /// Wait until every live node is stable.
    pub async fn wait_until_stable(&self) -> bool {
        self.wait_for_state(&self.alive(), PartitionState::Stable).await
    }
}

impl std::fmt::Debug for TestCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCluster")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("crashed", &self.crashed)
            .field("topology_id", &self.topology_id)
            .finish()
    }
}
