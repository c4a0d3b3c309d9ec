//! RPC message types for node-to-node communication.

use crate::counter::state::CounterState;
use crate::error::{NetworkError, RemoteFailure, Result as GridResult};
use crate::functions::EntryFunction;
use crate::lock::state::Waiter;
use crate::types::{
    CacheEntry, CommandFlags, CommandId, EntryKey, EntryMetadata, NodeId, TopologyId, Version,
    WriteCommand, WriteResult,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Network message wrapper for all communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// A write submitted on a node that is not the key's primary.
    Forward(ForwardRequest),

    /// Result of a forwarded write.
    ForwardResponse(Result<WriteResult, RemoteFailure>),

    /// Primary to backup replication.
    Backup(BackupRequest),

    /// Backup acknowledgment.
    BackupReply(Result<BackupAck, RemoteFailure>),

    /// Read served by the primary.
    Read(ReadRequest),

    /// Result of a read.
    ReadResponse(Result<Option<CacheEntry>, RemoteFailure>),

    /// Merge coordinator asking for divergent state.
    StateRequest(StateRequest),

    /// Divergent state of one member.
    StateResponse(Result<StateResponse, RemoteFailure>),

    /// The merge coordinator committed every resolution.
    MergeComplete(MergeComplete),

    /// A queued lock request was granted.
    LockNotification(LockNotification),

    /// A counter crossed into a new boundary state.
    CounterNotification(CounterNotification),

    /// Entries pushed to a node that gained ownership.
    StateTransfer(StateTransfer),

    /// Number of pushed entries the receiver installed.
    StateTransferReply(Result<usize, RemoteFailure>),

    /// Generic acknowledgment.
    Ack,

    /// Liveness probe.
    Ping(PingRequest),

    /// Response to ping.
    Pong(PongResponse),
}

impl Message {
    /// Short message name for logs and unexpected-reply errors.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Forward(_) => "forward",
            Message::ForwardResponse(_) => "forward_response",
            Message::Backup(_) => "backup",
            Message::BackupReply(_) => "backup_reply",
            Message::Read(_) => "read",
            Message::ReadResponse(_) => "read_response",
            Message::StateRequest(_) => "state_request",
            Message::StateResponse(_) => "state_response",
            Message::MergeComplete(_) => "merge_complete",
            Message::LockNotification(_) => "lock_notification",
            Message::CounterNotification(_) => "counter_notification",
            Message::StateTransfer(_) => "state_transfer",
            Message::StateTransferReply(_) => "state_transfer_reply",
            Message::Ack => "ack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
        }
    }
}

/// A write forwarded to the primary owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequest {
    /// The command, with the originator's command id.
    pub command: WriteCommand,
    /// Target key.
    pub key: EntryKey,
    /// Topology the originator resolved owners in.
    pub topology_id: TopologyId,
}

/// What the backup applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackupPayload {
    /// The primary's post-image.
    Value { value: Bytes, metadata: EntryMetadata },
    /// The key was removed.
    Tombstone,
    /// A commutative function, applied to the backup's own copy.
    Function(EntryFunction),
}

impl BackupPayload {
    /// Payload opcode name.
    pub fn opcode(&self) -> &'static str {
        match self {
            BackupPayload::Value { .. } => "value",
            BackupPayload::Tombstone => "tombstone",
            BackupPayload::Function(_) => "function",
        }
    }
}

/// Replication of one applied write to a backup owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRequest {
    /// Command being replicated.
    pub command_id: CommandId,
    /// Target key.
    pub key: EntryKey,
    /// Topology the primary sequenced the write in.
    pub topology_id: TopologyId,
    /// Version assigned by the primary.
    pub version: Version,
    /// Owners at sequencing time, primary first.
    pub owners: Vec<NodeId>,
    /// What to apply.
    pub payload: BackupPayload,
    /// The primary's result, replayed if this backup becomes primary and the
    /// command is retried.
    pub result: WriteResult,
    /// Admission flags of the command.
    pub flags: CommandFlags,
}

/// Backup acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupAck {
    /// Whether the payload changed the backup's copy.
    pub applied: bool,
}

/// Read of one key at its primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRequest {
    /// Target key.
    pub key: EntryKey,
    /// Topology the reader resolved owners in.
    pub topology_id: TopologyId,
}

/// Merge coordinator request for divergent state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRequest {
    /// Generation of the merged view.
    pub merge_generation: TopologyId,
    /// `None`: list keys touched since the split. `Some`: return these copies.
    pub keys: Option<Vec<EntryKey>>,
}

/// A member's copy of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySnapshot {
    /// The key.
    pub key: EntryKey,
    /// Value, `None` for absent or removed keys.
    pub value: Option<Bytes>,
    /// Metadata of the stored value.
    pub metadata: EntryMetadata,
    /// Version, `None` if the member never held the key.
    pub version: Option<Version>,
}

/// A member's answer to a state request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResponse {
    /// Responding member.
    pub responder: NodeId,
    /// Members of the responder's partition before the merge.
    pub partition: Vec<NodeId>,
    /// Keys touched since the split (first round).
    pub keys: Vec<EntryKey>,
    /// Copies of the requested keys (second round).
    pub snapshots: Vec<KeySnapshot>,
}

/// End of a merge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MergeComplete {
    /// Generation of the merged view.
    pub merge_generation: TopologyId,
}

/// A queued lock request was granted, or its lock removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockNotification {
    /// Lock name.
    pub lock: String,
    /// Request concerned.
    pub waiter: Waiter,
    /// The lock was removed while the request waited.
    pub removed: bool,
}

/// A bounded counter crossed into another state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterNotification {
    /// Counter name.
    pub name: String,
    /// Value after the update.
    pub value: i64,
    /// New state.
    pub state: CounterState,
}

/// Entries pushed to a new owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransfer {
    /// Topology the sender computed ownership in.
    pub topology_id: TopologyId,
    /// Copies, tombstones included.
    pub entries: Vec<KeySnapshot>,
}

/// Liveness probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    /// Sender's node ID.
    pub node_id: NodeId,
}

/// Response to ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongResponse {
    /// Responder's node ID.
    pub node_id: NodeId,
    /// Responder's installed topology.
    pub topology_id: TopologyId,
}

/// A message together with its sender, as framed on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending node.
    pub from: NodeId,
    /// Payload.
    pub message: Message,
}

/// Encode a message to bytes.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Decode a message from bytes.
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(data)
}

/// Largest frame accepted on either side of a connection.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame a message with length prefix for TCP transmission.
///
/// Payloads above [`MAX_FRAME_SIZE`] are rejected before anything is written,
/// so the peer never sees a length prefix it would refuse.
pub fn frame_message<T: Serialize>(msg: &T) -> GridResult<Vec<u8>> {
    let data = encode_message(msg)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge(data.len()).into());
    }
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DistributionError;

    #[test]
    fn test_backup_request_serialization() {
        let req = BackupRequest {
            command_id: CommandId::new(1, 9),
            key: EntryKey::new("c", b"k".to_vec()),
            topology_id: 4,
            version: Version::new(4, 2),
            owners: vec![1, 2],
            payload: BackupPayload::Tombstone,
            result: WriteResult {
                previous: Some(Bytes::from_static(b"old")),
                version: Some(Version::new(4, 2)),
                modified: true,
                function: None,
            },
            flags: CommandFlags::default(),
        };

        let encoded = encode_message(&Message::Backup(req)).unwrap();
        match decode_message::<Message>(&encoded).unwrap() {
            Message::Backup(decoded) => {
                assert_eq!(decoded.command_id, CommandId::new(1, 9));
                assert_eq!(decoded.payload, BackupPayload::Tombstone);
                assert_eq!(decoded.version, Version::new(4, 2));
            }
            other => panic!("Wrong message type: {}", other.name()),
        }
    }

    #[test]
    fn test_failure_reply_serialization() {
        let reply = Message::BackupReply(Err(RemoteFailure::Distribution(
            DistributionError::TopologyStale {
                command: 1,
                current: 2,
            },
        )));
        let encoded = encode_message(&reply).unwrap();
        match decode_message::<Message>(&encoded).unwrap() {
            Message::BackupReply(Err(RemoteFailure::Distribution(d))) => {
                assert!(d.is_transient());
            }
            other => panic!("Wrong message type: {}", other.name()),
        }
    }

    #[test]
    fn test_frame_message() {
        let envelope = Envelope {
            from: 3,
            message: Message::Ping(PingRequest { node_id: 3 }),
        };

        let framed = frame_message(&envelope).unwrap();

        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);

        let decoded: Envelope = decode_message(&framed[4..]).unwrap();
        assert_eq!(decoded.from, 3);
        assert!(matches!(decoded.message, Message::Ping(PingRequest { node_id: 3 })));
    }

    #[test]
    fn test_oversized_frame_is_rejected_before_writing() {
        let value = Bytes::from(vec![7u8; MAX_FRAME_SIZE + 1]);
        let result = frame_message(&value);
        assert!(matches!(
            result,
            Err(crate::error::Error::Network(NetworkError::FrameTooLarge(len))) if len > MAX_FRAME_SIZE
        ));

        let fits = Bytes::from(vec![7u8; 1024]);
        assert!(frame_message(&fits).is_ok());
    }
}
