//! In-process network with fault injection.
//!
//! Every request and reply is pushed through the bincode codec so that
//! in-process clusters exercise the same serialization as the TCP transport.
//! Partitions, crashes and lost replies are injected per node pair; whole
//! message kinds can be dropped in flight.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{decode_message, encode_message, Envelope, Message};
use crate::network::transport::{MessageHandler, Transport};
use crate::types::NodeId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// A cut between two groups of nodes.
#[derive(Debug, Clone)]
pub struct NetworkPartition {
    /// Nodes in partition A.
    pub side_a: HashSet<NodeId>,

    /// Nodes in partition B.
    pub side_b: HashSet<NodeId>,
}

impl NetworkPartition {
    /// Check if this partition separates the two nodes.
    pub fn separates(&self, from: NodeId, to: NodeId) -> bool {
        (self.side_a.contains(&from) && self.side_b.contains(&to))
            || (self.side_b.contains(&from) && self.side_a.contains(&to))
    }
}

/// Registry of in-process nodes.
#[derive(Default)]
pub struct InMemoryNetwork {
    handlers: RwLock<HashMap<NodeId, Arc<dyn MessageHandler>>>,
    partitions: RwLock<Vec<NetworkPartition>>,
    crashed: RwLock<HashSet<NodeId>>,
    lost_replies: RwLock<HashSet<NodeId>>,
    dropped_kinds: RwLock<HashSet<&'static str>>,
    delivered: AtomicU64,
}

impl InMemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport sending from `node`.
    pub fn transport(self: &Arc<Self>, node: NodeId) -> Arc<InMemoryTransport> {
        Arc::new(InMemoryTransport {
            network: self.clone(),
            local: node,
        })
    }

    /// Attach the handler receiving messages for `node`.
    pub fn register(&self, node: NodeId, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().insert(node, handler);
    }

    /// Cut every link between the two sides.
    pub fn partition(&self, side_a: &[NodeId], side_b: &[NodeId]) {
        self.partitions.write().push(NetworkPartition {
            side_a: side_a.iter().copied().collect(),
            side_b: side_b.iter().copied().collect(),
        });
    }

    /// Remove every partition.
    pub fn heal(&self) {
        self.partitions.write().clear();
    }

    /// Stop delivering to and from a node.
    pub fn crash(&self, node: NodeId) {
        self.crashed.write().insert(node);
    }

    /// Resume delivering to and from a node.
    pub fn recover(&self, node: NodeId) {
        self.crashed.write().remove(&node);
    }

    /// Handle requests on `node` but lose its replies.
    pub fn fail_replies_from(&self, node: NodeId, fail: bool) {
        if fail {
            self.lost_replies.write().insert(node);
        } else {
            self.lost_replies.write().remove(&node);
        }
    }

    /// Drop every request of the given kind (see [`Message::name`]) before
    /// it reaches a handler.
    pub fn drop_messages(&self, kind: &'static str, drop: bool) {
        if drop {
            self.dropped_kinds.write().insert(kind);
        } else {
            self.dropped_kinds.write().remove(kind);
        }
    }

    /// Whether a message from `from` reaches `to`.
    pub fn can_reach(&self, from: NodeId, to: NodeId) -> bool {
        let crashed = self.crashed.read();
        if crashed.contains(&from) || crashed.contains(&to) {
            return false;
        }
        !self.partitions.read().iter().any(|p| p.separates(from, to))
    }

    /// Number of requests delivered to a handler.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    async fn deliver(&self, from: NodeId, target: NodeId, msg: Message) -> Result<Message> {
        if !self.can_reach(from, target) {
            return Err(NetworkError::Unreachable(target).into());
        }
        if self.dropped_kinds.read().contains(msg.name()) {
            trace!(from, target, msg = msg.name(), "Dropping message");
            return Err(NetworkError::ConnectionClosed.into());
        }
        let handler = self
            .handlers
            .read()
            .get(&target)
            .cloned()
            .ok_or(NetworkError::UnknownNode(target))?;

        let bytes = encode_message(&Envelope { from, message: msg })?;
        let envelope: Envelope = decode_message(&bytes)?;
        trace!(from, target, msg = envelope.message.name(), "Delivering message");
        self.delivered.fetch_add(1, Ordering::Relaxed);

        let reply = handler.handle(envelope.from, envelope.message).await;

        if self.lost_replies.read().contains(&target) || !self.can_reach(target, from) {
            return Err(NetworkError::ConnectionClosed.into());
        }
        let bytes = encode_message(&reply)?;
        Ok(decode_message(&bytes)?)
    }
}

impl std::fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryNetwork")
            .field("nodes", &self.handlers.read().len())
            .field("partitions", &self.partitions.read().len())
            .field("crashed", &*self.crashed.read())
            .finish()
    }
}

/// Transport of one node over an [`InMemoryNetwork`].
#[derive(Debug)]
pub struct InMemoryTransport {
    network: Arc<InMemoryNetwork>,
    local: NodeId,
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn local_node(&self) -> NodeId {
        self.local
    }

    async fn request(&self, target: NodeId, msg: Message) -> Result<Message> {
        self.network.deliver(self.local, target, msg).await
    }
}
