//! Transport seam between nodes.

use crate::error::Result;
use crate::network::rpc::Message;
use crate::types::NodeId;
use async_trait::async_trait;

/// Handler for incoming messages.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle a request from `from` and produce the reply.
    async fn handle(&self, from: NodeId, msg: Message) -> Message;
}

/// Request/reply messaging from the local node to its peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The node this transport sends from.
    fn local_node(&self) -> NodeId;

    /// Send a request and wait for the reply.
    async fn request(&self, target: NodeId, msg: Message) -> Result<Message>;
}
