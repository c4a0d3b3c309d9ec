//! Data grid node.
//!
//! A [`DataGrid`] wires the components of one member together: local storage
//! and version store, the triangle dispatcher, the partition monitor with its
//! merge coordinator, state transfer, and the lock and counter services. It
//! follows the membership provider's views and answers peer messages through
//! [`DataGrid::message_handler`].

pub mod context;
pub mod storage;
pub mod versions;

use crate::cluster::{ClusterView, MembershipProvider};
use crate::config::GridConfig;
use crate::counter::CounterService;
use crate::dispatch::TriangleDispatcher;
use crate::error::{Error, RemoteFailure, Result};
use crate::events::{Listener, Subscription};
use crate::functions::{EntryFunction, FunctionResult};
use crate::lock::LockService;
use crate::metrics::MetricsSnapshot;
use crate::network::rpc::{Message, PongResponse};
use crate::network::{MessageHandler, Transport};
use crate::partition::{MergeCoordinator, PartitionState};
use crate::partitioning::{ConsistentHashOracle, OwnershipOracle};
use crate::rebalancing::StateTransferCoordinator;
use crate::types::{
    CacheEntry, EntryKey, EntryMetadata, GridStats, NodeId, TopologyId, WriteCommand, WriteResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use context::NodeContext;
use std::sync::Arc;
use std::time::Duration;
use storage::{LocalStorage, MokaStorage};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Components of one member, shared by the view loop and the message handler.
struct GridNode {
    ctx: Arc<NodeContext>,
    dispatcher: Arc<TriangleDispatcher>,
    merge: Arc<MergeCoordinator>,
    transfer: Arc<StateTransferCoordinator>,
    locks: Arc<LockService>,
    counters: Arc<CounterService>,
}

impl GridNode {
    /// Install a view and start whatever it requires.
    fn apply_view(self: &Arc<Self>, view: ClusterView) {
        let node_id = self.ctx.node_id;
        let Some(transition) = self.ctx.monitor.on_view_change(view) else {
            return;
        };
        let view = transition.change.current.clone();

        if transition.change.has_departures() {
            let node = self.clone();
            let departed = transition.change.left.clone();
            tokio::spawn(async move {
                if let Err(e) = node.locks.release_departed(&departed).await {
                    warn!(node_id, error = %e, "Failed to release locks of departed members");
                }
            });
        }

        if transition.needs_merge() {
            let Some(merge_generation) = transition.merge_generation else {
                return;
            };
            if view.coordinator() != Some(node_id) {
                debug!(
                    node_id,
                    merge_generation,
                    coordinator = ?view.coordinator(),
                    "Waiting for merge coordinator"
                );
                return;
            }
            let node = self.clone();
            let topology_id = view.topology_id;
            tokio::spawn(node.drive_merge(merge_generation, topology_id));
        } else {
            self.spawn_rebalance();
        }
    }

    /// Coordinate the merge until it completes or a newer view takes it
    /// over, then make sure every member hears of the completion.
    async fn drive_merge(self: Arc<Self>, merge_generation: TopologyId, topology_id: TopologyId) {
        let node_id = self.ctx.node_id;
        let pause = self.ctx.config.replication.retry.max_backoff;
        loop {
            match self.merge.run_with_attempts(merge_generation).await {
                Ok(report) => {
                    self.finish_merge(merge_generation);
                    self.merge.redeliver_completion(&report).await;
                    return;
                }
                Err(e) if self.merge.still_coordinating(merge_generation, topology_id) => {
                    error!(
                        node_id,
                        merge_generation,
                        error = %e,
                        "Merge attempts exhausted, starting over"
                    );
                    tokio::time::sleep(pause).await;
                }
                Err(e) => {
                    warn!(
                        node_id,
                        merge_generation,
                        topology_id,
                        error = %e,
                        "Merge abandoned to a newer view"
                    );
                    return;
                }
            }
        }
    }

    /// Leave the merging state and move copies to their owners.
    fn finish_merge(self: &Arc<Self>, merge_generation: TopologyId) {
        if self.ctx.monitor.complete_merge(merge_generation) {
            self.spawn_rebalance();
        }
    }

    fn spawn_rebalance(self: &Arc<Self>) {
        let node = self.clone();
        tokio::spawn(async move {
            if let Err(e) = node.transfer.rebalance().await {
                warn!(node_id = node.ctx.node_id, error = %e, "State transfer failed");
            }
        });
    }
}

/// Answers peer requests on behalf of a [`GridNode`].
struct GridMessageHandler {
    node: Arc<GridNode>,
}

fn remote<T>(result: Result<T>) -> std::result::Result<T, RemoteFailure> {
    result.map_err(|e| RemoteFailure::from(&e))
}

#[async_trait]
impl MessageHandler for GridMessageHandler {
    async fn handle(&self, from: NodeId, msg: Message) -> Message {
        let node = &self.node;
        trace!(
            node_id = node.ctx.node_id,
            from,
            msg = msg.name(),
            "Handling message"
        );
        match msg {
            Message::Forward(request) => {
                Message::ForwardResponse(remote(node.dispatcher.handle_forward(request).await))
            }
            Message::Backup(request) => {
                Message::BackupReply(remote(node.dispatcher.handle_backup(request).await))
            }
            Message::Read(request) => {
                Message::ReadResponse(remote(node.dispatcher.handle_read(request).await))
            }
            Message::StateRequest(request) => {
                Message::StateResponse(remote(node.merge.handle_state_request(request).await))
            }
            Message::MergeComplete(complete) => {
                node.finish_merge(complete.merge_generation);
                Message::Ack
            }
            Message::StateTransfer(transfer) => {
                Message::StateTransferReply(remote(node.transfer.handle_transfer(transfer).await))
            }
            Message::LockNotification(notification) => {
                node.locks.handle_notification(notification);
                Message::Ack
            }
            Message::CounterNotification(notification) => {
                node.counters.handle_notification(notification);
                Message::Ack
            }
            Message::Ping(_) => Message::Pong(PongResponse {
                node_id: node.ctx.node_id,
                topology_id: node.ctx.monitor.topology_id(),
            }),
            other => {
                debug!(
                    node_id = node.ctx.node_id,
                    from,
                    msg = other.name(),
                    "Unexpected request"
                );
                Message::Ack
            }
        }
    }
}

/// One member of the data grid.
pub struct DataGrid {
    node: Arc<GridNode>,
    handler: Arc<GridMessageHandler>,
    membership: Arc<dyn MembershipProvider>,
    shutdown_tx: mpsc::Sender<()>,
}

impl DataGrid {
    /// Start a member with Moka storage and consistent-hash ownership.
    pub fn new(
        config: GridConfig,
        membership: Arc<dyn MembershipProvider>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let storage: Arc<dyn LocalStorage> = Arc::new(MokaStorage::new(&config.storage));
        let oracle: Arc<dyn OwnershipOracle> = Arc::new(ConsistentHashOracle::new(
            config.num_owners,
            config.vnodes_per_node,
        ));
        Self::with_parts(config, membership, transport, oracle, storage)
    }

    /// Start a member with explicit ownership and storage.
    ///
    /// This will:
    /// 1. Validate the configuration
    /// 2. Install the provider's current view
    /// 3. Create the dispatcher, merge, transfer, lock and counter components
    /// 4. Start following view changes
    pub fn with_parts(
        config: GridConfig,
        membership: Arc<dyn MembershipProvider>,
        transport: Arc<dyn Transport>,
        oracle: Arc<dyn OwnershipOracle>,
        storage: Arc<dyn LocalStorage>,
    ) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let node_id = config.node_id;
        let view = membership.current_view();
        info!(
            node_id,
            topology_id = view.topology_id,
            members = ?view.members,
            "Starting data grid"
        );

        let ctx = Arc::new(NodeContext::new(config, view, transport, oracle, storage));
        let dispatcher = Arc::new(TriangleDispatcher::new(ctx.clone()));
        let node = Arc::new(GridNode {
            merge: Arc::new(MergeCoordinator::new(ctx.clone(), dispatcher.clone())),
            transfer: Arc::new(StateTransferCoordinator::new(ctx.clone())),
            locks: Arc::new(LockService::new(ctx.clone(), dispatcher.clone())),
            counters: Arc::new(CounterService::new(ctx.clone(), dispatcher.clone())),
            dispatcher,
            ctx,
        });

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let mut views = membership.subscribe();
        let follower = node.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!(node_id, "View loop shutting down");
                        break;
                    }
                    view = views.recv() => match view {
                        Some(view) => follower.apply_view(view),
                        None => break,
                    },
                }
            }
        });

        let handler = Arc::new(GridMessageHandler { node: node.clone() });
        info!(node_id, "Data grid started");
        Ok(Self {
            node,
            handler,
            membership,
            shutdown_tx,
        })
    }

    /// Handler to register with the transport layer.
    pub fn message_handler(&self) -> Arc<dyn MessageHandler> {
        self.handler.clone()
    }

    /// This member's id.
    pub fn node_id(&self) -> NodeId {
        self.node.ctx.node_id
    }

    /// Handle on a named cache.
    pub fn cache(&self, name: impl Into<String>) -> GridCache {
        GridCache {
            node: self.node.clone(),
            name: name.into(),
        }
    }

    /// Submit a write command for `key`.
    pub async fn submit(&self, command: WriteCommand, key: EntryKey) -> Result<WriteResult> {
        self.node.dispatcher.submit(command, key).await
    }

    /// A fresh command id originating here.
    pub fn next_command_id(&self) -> crate::types::CommandId {
        self.node.ctx.next_command_id()
    }

    /// Distributed locks.
    pub fn locks(&self) -> &LockService {
        &self.node.locks
    }

    /// Distributed counters.
    pub fn counters(&self) -> &CounterService {
        &self.node.counters
    }

    /// Installed view.
    pub fn view(&self) -> ClusterView {
        self.node.ctx.monitor.view()
    }

    /// Topology of the installed view.
    pub fn topology_id(&self) -> TopologyId {
        self.node.ctx.monitor.topology_id()
    }

    /// Availability of the local partition.
    pub fn partition_state(&self) -> PartitionState {
        self.node.ctx.monitor.state()
    }

    /// Install a view directly, bypassing the membership provider.
    pub fn apply_view(&self, view: ClusterView) {
        self.node.apply_view(view);
    }

    /// Return a degraded or unavailable partition to service.
    pub fn force_available(&self) -> bool {
        self.node.ctx.monitor.force_available()
    }

    /// Owners of a key under the installed view, primary first.
    pub fn owners(&self, key: &EntryKey) -> Vec<NodeId> {
        self.node.ctx.owners(key).1
    }

    /// This member's copy of a key, without going through the primary.
    pub async fn local_entry(&self, key: &EntryKey) -> Result<Option<CacheEntry>> {
        Ok(self.node.ctx.storage.get(key).await?)
    }

    /// Run storage maintenance (expiry) now.
    pub async fn run_pending_tasks(&self) {
        self.node.ctx.storage.run_pending_tasks().await;
    }

    /// Local statistics.
    pub fn stats(&self) -> GridStats {
        let ctx = &self.node.ctx;
        GridStats {
            entry_count: ctx.storage.entry_count(),
            versioned_keys: ctx.versions.len(),
            remembered_commands: self.node.dispatcher.seen().len(),
        }
    }

    /// Metric values.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.node.ctx.metrics.snapshot()
    }

    /// The membership provider this member follows.
    pub fn membership(&self) -> &Arc<dyn MembershipProvider> {
        &self.membership
    }

    /// Stop following view changes.
    pub async fn shutdown(&self) {
        info!(node_id = self.node_id(), "Shutting down data grid");
        let _ = self.shutdown_tx.send(()).await;
    }
}

impl std::fmt::Debug for DataGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataGrid")
            .field("node_id", &self.node_id())
            .field("topology_id", &self.topology_id())
            .field("state", &self.partition_state())
            .finish()
    }
}

/// Handle on one named cache of the grid.
#[derive(Clone)]
pub struct GridCache {
    node: Arc<GridNode>,
    name: String,
}

impl GridCache {
    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self, key: impl Into<Bytes>) -> EntryKey {
        EntryKey::new(self.name.clone(), key)
    }

    async fn submit(&self, key: EntryKey, command: WriteCommand) -> Result<WriteResult> {
        self.node.dispatcher.submit(command, key).await
    }

    /// Store a value; returns the previous one.
    pub async fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<Option<Bytes>> {
        let command = WriteCommand::put(self.node.ctx.next_command_id(), self.name.clone(), value);
        Ok(self.submit(self.key(key), command).await?.previous)
    }

    /// Store a value that expires after `lifespan`.
    pub async fn put_with_lifespan(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        lifespan: Duration,
    ) -> Result<Option<Bytes>> {
        let command = WriteCommand::put_with_lifespan(
            self.node.ctx.next_command_id(),
            self.name.clone(),
            value,
            lifespan,
        );
        Ok(self.submit(self.key(key), command).await?.previous)
    }

    /// Store a value only if the key is absent; returns whether it was stored.
    pub async fn put_if_absent(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<bool> {
        let command = WriteCommand::functional(
            self.node.ctx.next_command_id(),
            self.name.clone(),
            EntryFunction::PutIfAbsent {
                value: value.into(),
                metadata: EntryMetadata::default(),
            },
        );
        let result = self.submit(self.key(key), command).await?;
        Ok(matches!(result.function, Some(FunctionResult::Inserted(true))))
    }

    /// Read a value at its primary.
    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        Ok(self.get_entry(key).await?.map(|e| e.value))
    }

    /// Read an entry with its version at the primary.
    pub async fn get_entry(&self, key: impl Into<Bytes>) -> Result<Option<CacheEntry>> {
        self.node.dispatcher.read(&self.key(key)).await
    }

    /// Remove a key; returns the previous value.
    pub async fn remove(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        let command = WriteCommand::remove(self.node.ctx.next_command_id(), self.name.clone());
        Ok(self.submit(self.key(key), command).await?.previous)
    }

    /// Listen to changes applied on this member.
    pub fn subscribe(&self, listener: Listener) -> Subscription {
        self.node.ctx.events.subscribe(self.name.clone(), listener)
    }
}

impl std::fmt::Debug for GridCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridCache")
            .field("node_id", &self.node.ctx.node_id)
            .field("name", &self.name)
            .finish()
    }
}
