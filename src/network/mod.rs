//! Network communication layer.

pub mod memory;
pub mod rpc;
pub mod server;
pub mod transport;

pub use memory::{InMemoryNetwork, InMemoryTransport, NetworkPartition};
pub use rpc::{
    BackupAck, BackupPayload, BackupRequest, CounterNotification, Envelope, ForwardRequest,
    KeySnapshot, LockNotification, MergeComplete, Message, PingRequest, PongResponse,
    ReadRequest, StateRequest, StateResponse, StateTransfer,
};
pub use server::{NetworkServer, TcpTransport};
pub use transport::{MessageHandler, Transport};
