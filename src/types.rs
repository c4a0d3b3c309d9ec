//! Core types used throughout the grid.

use crate::functions::{EntryFunction, FunctionResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Monotonic identifier of a cluster membership/ownership mapping.
pub type TopologyId = u64;

/// Per-key version: topology generation first, then per-key sequence.
///
/// The derived ordering is lexicographic over `(generation, sequence)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Version {
    /// Topology generation the write was sequenced in.
    pub generation: TopologyId,
    /// Sequence within the generation.
    pub sequence: u64,
}

impl Version {
    /// Create a version.
    pub const fn new(generation: TopologyId, sequence: u64) -> Self {
        Self {
            generation,
            sequence,
        }
    }

    /// The version following `self` for a write sequenced in `generation`.
    ///
    /// A generation older than the stored one keeps the stored generation so
    /// the result is always strictly greater.
    pub fn successor(&self, generation: TopologyId) -> Self {
        if generation > self.generation {
            Self::new(generation, 1)
        } else {
            Self::new(self.generation, self.sequence + 1)
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.generation, self.sequence)
    }
}

/// Globally unique command identifier: originating node plus local sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId {
    /// Node that created the command.
    pub origin: NodeId,
    /// Sequence local to the origin.
    pub sequence: u64,
}

impl CommandId {
    /// Create a command id.
    pub const fn new(origin: NodeId, sequence: u64) -> Self {
        Self { origin, sequence }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.origin, self.sequence)
    }
}

/// Key of an entry: cache name plus opaque key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    /// Cache the key belongs to.
    pub cache: String,
    /// Opaque key bytes.
    pub key: Bytes,
}

/// Prefix of the caches the grid keeps its own state in (locks, counters).
pub const INTERNAL_CACHE_PREFIX: &str = "__";

impl EntryKey {
    /// Create an entry key.
    pub fn new(cache: impl Into<String>, key: impl Into<Bytes>) -> Self {
        Self {
            cache: cache.into(),
            key: key.into(),
        }
    }

    /// Whether the key lives in one of the grid's internal caches. Internal
    /// entries never expire and are never evicted.
    pub fn is_internal(&self) -> bool {
        self.cache.starts_with(INTERNAL_CACHE_PREFIX)
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cache, String::from_utf8_lossy(&self.key))
    }
}

/// Metadata attached to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Lifespan in milliseconds, if the entry expires.
    pub lifespan_ms: Option<u64>,
}

impl EntryMetadata {
    /// Metadata with a lifespan.
    pub fn with_lifespan(lifespan: Duration) -> Self {
        Self {
            lifespan_ms: Some(lifespan.as_millis() as u64),
        }
    }

    /// The lifespan as a duration.
    pub fn lifespan(&self) -> Option<Duration> {
        self.lifespan_ms.map(Duration::from_millis)
    }
}

/// A stored entry with its version stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Entry key.
    pub key: EntryKey,
    /// Value bytes.
    pub value: Bytes,
    /// Version assigned by the primary.
    pub version: Version,
    /// Entry metadata.
    pub metadata: EntryMetadata,
    /// Owners at the time of the write, primary first.
    pub owners: Vec<NodeId>,
}

/// The operation carried by a write command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteKind {
    /// Insert or overwrite the value.
    Put { value: Bytes, metadata: EntryMetadata },
    /// Delete the key.
    Remove,
    /// Evaluate a function against the current value.
    Functional(EntryFunction),
}

/// Flags altering how a command is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandFlags {
    /// The command commits a partition-merge resolution.
    pub merge_resolution: bool,
}

/// A write command with its globally unique id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteCommand {
    /// Idempotency key.
    pub id: CommandId,
    /// Target cache.
    pub cache: String,
    /// Operation.
    pub kind: WriteKind,
    /// Admission flags.
    pub flags: CommandFlags,
}

impl WriteCommand {
    /// Create a Put command.
    pub fn put(id: CommandId, cache: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(
            id,
            cache,
            WriteKind::Put {
                value: value.into(),
                metadata: EntryMetadata::default(),
            },
        )
    }

    /// Create a Put command with a lifespan.
    pub fn put_with_lifespan(
        id: CommandId,
        cache: impl Into<String>,
        value: impl Into<Bytes>,
        lifespan: Duration,
    ) -> Self {
        Self::new(
            id,
            cache,
            WriteKind::Put {
                value: value.into(),
                metadata: EntryMetadata::with_lifespan(lifespan),
            },
        )
    }

    /// Create a Remove command.
    pub fn remove(id: CommandId, cache: impl Into<String>) -> Self {
        Self::new(id, cache, WriteKind::Remove)
    }

    /// Create a functional command.
    pub fn functional(id: CommandId, cache: impl Into<String>, function: EntryFunction) -> Self {
        Self::new(id, cache, WriteKind::Functional(function))
    }

    /// Create a command from its parts.
    pub fn new(id: CommandId, cache: impl Into<String>, kind: WriteKind) -> Self {
        Self {
            id,
            cache: cache.into(),
            kind,
            flags: CommandFlags::default(),
        }
    }

    /// Mark the command as a merge resolution.
    pub fn as_merge_resolution(mut self) -> Self {
        self.flags.merge_resolution = true;
        self
    }

    /// Short operation name for logs.
    pub fn op_name(&self) -> &'static str {
        match &self.kind {
            WriteKind::Put { .. } => "put",
            WriteKind::Remove => "remove",
            WriteKind::Functional(f) => f.name(),
        }
    }
}

/// Outcome of a write, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    /// Value before the write.
    pub previous: Option<Bytes>,
    /// Version of the key after the write (unchanged if nothing was written).
    pub version: Option<Version>,
    /// Whether the entry changed.
    pub modified: bool,
    /// Return value of a functional command.
    pub function: Option<FunctionResult>,
}

/// Statistics of the local node.
#[derive(Debug, Clone, Default)]
pub struct GridStats {
    /// Number of entries in local storage.
    pub entry_count: u64,
    /// Number of keys with a version stamp (including tombstones).
    pub versioned_keys: usize,
    /// Number of remembered command ids.
    pub remembered_commands: usize,
}
