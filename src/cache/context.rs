//! Shared components of one grid node.

use crate::cache::storage::LocalStorage;
use crate::cache::versions::{VersionMerge, VersionStore};
use crate::cluster::ClusterView;
use crate::config::GridConfig;
use crate::dispatch::KeyLocks;
use crate::error::Result;
use crate::events::{EntryEvent, EventOrigin, EventRegistry};
use crate::metrics::GridMetrics;
use crate::network::rpc::KeySnapshot;
use crate::network::Transport;
use crate::partition::{PartitionMonitor, PartitionState};
use crate::partitioning::OwnershipOracle;
use crate::types::{CacheEntry, CommandId, EntryKey, NodeId, Version};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Components shared by the dispatcher, the merge coordinator, state transfer
/// and the coordination services of one node.
pub struct NodeContext {
    pub node_id: NodeId,
    pub config: GridConfig,
    pub transport: Arc<dyn Transport>,
    pub oracle: Arc<dyn OwnershipOracle>,
    pub storage: Arc<dyn LocalStorage>,
    pub versions: VersionStore,
    pub key_locks: KeyLocks,
    pub events: EventRegistry,
    pub metrics: GridMetrics,
    pub monitor: PartitionMonitor,
    command_seq: AtomicU64,
}

impl NodeContext {
    /// Assemble a context.
    pub fn new(
        config: GridConfig,
        view: ClusterView,
        transport: Arc<dyn Transport>,
        oracle: Arc<dyn OwnershipOracle>,
        storage: Arc<dyn LocalStorage>,
    ) -> Self {
        let monitor = PartitionMonitor::new(config.node_id, &config.partition, view);
        Self {
            node_id: config.node_id,
            config,
            transport,
            oracle,
            storage,
            versions: VersionStore::new(),
            key_locks: KeyLocks::new(),
            events: EventRegistry::new(),
            metrics: GridMetrics::new(),
            monitor,
            command_seq: AtomicU64::new(0),
        }
    }

    /// A fresh command id originating here.
    pub fn next_command_id(&self) -> CommandId {
        CommandId::new(
            self.node_id,
            self.command_seq.fetch_add(1, Ordering::Relaxed) + 1,
        )
    }

    /// Installed view and the owners of `key` under it.
    pub fn owners(&self, key: &EntryKey) -> (ClusterView, Vec<NodeId>) {
        let view = self.monitor.view();
        let owners = self.oracle.owners(key, &view);
        (view, owners)
    }

    /// This node's copy of a key, tombstones included.
    pub async fn snapshot(&self, key: &EntryKey) -> Result<KeySnapshot> {
        let entry = self.storage.get(key).await?;
        Ok(KeySnapshot {
            key: key.clone(),
            value: entry.as_ref().map(|e| e.value.clone()),
            metadata: entry.map(|e| e.metadata).unwrap_or_default(),
            version: self.versions.get(key),
        })
    }

    /// Whether a removal at `version` can no longer be undone by a write in
    /// flight: the cluster is whole and the removal predates the installed
    /// view, whose backups reject older topologies.
    pub fn tombstone_settled(&self, version: Version) -> bool {
        self.monitor.state() == PartitionState::Stable
            && self.monitor.split_generation().is_none()
            && version.generation < self.monitor.topology_id()
    }

    /// Install a copy received from another node if it is strictly newer.
    pub async fn install_copy(&self, copy: KeySnapshot, owners: Vec<NodeId>) -> Result<bool> {
        let version = match copy.version {
            Some(v) => v,
            None => return Ok(false),
        };

        let _guard = self.key_locks.lock(&copy.key).await;
        if copy.value.is_none()
            && self.versions.get(&copy.key).is_none()
            && self.tombstone_settled(version)
        {
            return Ok(false);
        }
        if let VersionMerge::Conflict { current } = self.versions.admits(&copy.key, version) {
            trace!(
                node_id = self.node_id,
                key = %copy.key,
                offered = %version,
                current = %current,
                "Ignoring copy no newer than the local one"
            );
            return Ok(false);
        }

        let previous = self.storage.get(&copy.key).await?.map(|e| e.value);
        match &copy.value {
            Some(value) => {
                self.storage
                    .put(CacheEntry {
                        key: copy.key.clone(),
                        value: value.clone(),
                        version,
                        metadata: copy.metadata,
                        owners,
                    })
                    .await?
            }
            None => {
                self.storage.remove(&copy.key).await?;
            }
        }
        self.versions.merge(&copy.key, version);

        self.events.fire(&EntryEvent::new(
            copy.key,
            previous,
            copy.value,
            version,
            EventOrigin::Transfer,
        ));
        Ok(true)
    }

    /// Forget the version of a settled removal. Returns whether it was
    /// dropped.
    pub async fn prune_tombstone(&self, key: &EntryKey) -> Result<bool> {
        let _guard = self.key_locks.lock(key).await;
        let Some(version) = self.versions.get(key) else {
            return Ok(false);
        };
        if !self.tombstone_settled(version) || self.storage.get(key).await?.is_some() {
            return Ok(false);
        }
        self.versions.forget(key);
        Ok(true)
    }

    /// Drop a copy this node no longer owns.
    pub async fn discard_copy(&self, key: &EntryKey) -> Result<()> {
        let _guard = self.key_locks.lock(key).await;
        self.storage.remove(key).await?;
        self.versions.forget(key);
        Ok(())
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id)
            .field("monitor", &self.monitor)
            .finish()
    }
}
