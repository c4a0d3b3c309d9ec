//! Error types for the data grid core.

use crate::partition::PartitionState;
use crate::types::{CommandId, NodeId, TopologyId};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias for grid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the data grid.
#[derive(Error, Debug)]
pub enum Error {
    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Local storage errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Write distribution errors (topology, replication, retries).
    #[error("distribution error: {0}")]
    Distribution(#[from] DistributionError),

    /// The local partition does not accept the operation in its current state.
    #[error("partition unavailable: {state}")]
    Availability { state: PartitionState },

    /// Distributed lock errors.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Distributed counter errors.
    #[error("counter error: {0}")]
    Counter(#[from] CounterError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Error reported by a remote node.
    #[error("remote error: {0}")]
    RemoteError(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the dispatcher may retry the operation with a refreshed view.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Distribution(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed before a reply arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// The target node is not reachable from this node.
    #[error("node {0} unreachable")]
    Unreachable(NodeId),

    /// No route is known for the node.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// The peer answered with a message of the wrong kind.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Frame exceeds the maximum accepted size.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Local storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Storage rejected the write.
    #[error("write rejected: {0}")]
    WriteRejected(String),

    /// A stored value could not be decoded.
    #[error("corrupt value for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Storage is not available.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while distributing a write to its owners.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionError {
    /// The receiver has a newer topology than the command.
    #[error("command {command} carries stale topology, receiver is at {current}")]
    TopologyStale { command: TopologyId, current: TopologyId },

    /// The command carries a topology the receiver has not installed yet.
    #[error("command {command} carries topology ahead of receiver at {current}")]
    TopologyAhead { command: TopologyId, current: TopologyId },

    /// The receiver is reconciling partitions.
    #[error("state transfer in progress")]
    StateTransferInProgress,

    /// The receiver is not the primary owner for the key.
    #[error("not primary, primary is {primary:?}")]
    NotPrimary { primary: Option<NodeId> },

    /// The primary owner could not be reached.
    #[error("primary {node} unreachable: {reason}")]
    PrimaryUnreachable { node: NodeId, reason: String },

    /// The view has no members to own the key.
    #[error("no owners for key")]
    NoOwners,

    /// Not enough backups acknowledged the write.
    #[error("partial replication of {command_id}: {acked} of {required} backups acknowledged")]
    PartialReplication {
        command_id: CommandId,
        acked: usize,
        required: usize,
    },

    /// Transient failures persisted past the retry bound.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl DistributionError {
    /// Transient errors are retried internally with a refreshed owner list.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DistributionError::TopologyStale { .. }
                | DistributionError::TopologyAhead { .. }
                | DistributionError::StateTransferInProgress
                | DistributionError::NotPrimary { .. }
                | DistributionError::PrimaryUnreachable { .. }
        )
    }
}

/// Distributed lock errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The lock was never defined.
    #[error("lock {0} is not defined")]
    Undefined(String),

    /// The lock could not be acquired in time.
    #[error("timed out acquiring lock {name} after {waited_ms}ms")]
    Timeout { name: String, waited_ms: u64 },

    /// The caller does not hold the lock.
    #[error("lock {0} is not held by the caller")]
    NotOwner(String),

    /// The lock was removed while the caller was waiting.
    #[error("lock {0} was removed")]
    Deleted(String),

    /// A non-reentrant lock was re-acquired by its holder.
    #[error("lock {0} is not reentrant and already held by the caller")]
    NotReentrant(String),
}

/// Distributed counter errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CounterError {
    /// The counter was never defined.
    #[error("counter {0} is not defined")]
    Undefined(String),

    /// Compare-and-set lost: the current value differs from the expected one.
    #[error("compare-and-set failed, current value is {current}")]
    CasFailure { current: i64 },

    /// The update would move the value outside its bounds.
    #[error("update would exceed bounds, current value is {current}")]
    BoundsExceeded { current: i64 },

    /// The counter exists with a different consistency class.
    #[error("counter {name} is {actual}, not {requested}")]
    WrongKind {
        name: String,
        actual: &'static str,
        requested: &'static str,
    },
}

/// Serializable failure carried back over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteFailure {
    /// Distribution error, transient or not.
    Distribution(DistributionError),
    /// The remote partition rejected the operation.
    Unavailable(PartitionState),
    /// Storage failure on the remote node.
    Storage(String),
    /// Anything else.
    Other(String),
}

impl From<&Error> for RemoteFailure {
    fn from(e: &Error) -> Self {
        match e {
            Error::Distribution(d) => RemoteFailure::Distribution(d.clone()),
            Error::Availability { state } => RemoteFailure::Unavailable(*state),
            Error::Storage(s) => RemoteFailure::Storage(s.to_string()),
            other => RemoteFailure::Other(other.to_string()),
        }
    }
}

impl From<RemoteFailure> for Error {
    fn from(f: RemoteFailure) -> Self {
        match f {
            RemoteFailure::Distribution(d) => Error::Distribution(d),
            RemoteFailure::Unavailable(state) => Error::Availability { state },
            RemoteFailure::Storage(s) => Error::Storage(StorageError::Unavailable(s)),
            RemoteFailure::Other(s) => Error::RemoteError(s),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}
