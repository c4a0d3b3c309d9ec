//! Owner-based replication core for a clustered in-memory data grid.
//!
//! Every key has an ordered owner list under the installed cluster view: a
//! primary followed by backups. Writes are sequenced by the primary, which
//! stamps a per-key version and fans the result out to the backups
//! ("triangle" dispatch). On top of that the crate provides:
//!
//! - **Partition handling**: a per-node partition state machine, and a merge
//!   coordinator that reconciles divergent copies with a merge policy when
//!   split partitions rejoin
//! - **State transfer**: copies follow ownership when the view changes
//! - **Distributed locks**: FIFO, reentrant or not, owned by node or instance
//! - **Distributed counters**: strong (bounded, CAS) and weak (commutative)
//!
//! # Example
//!
//! ```rust,no_run
//! use gridcore::{ClusterView, DataGrid, GridConfig, InMemoryNetwork, StaticMembership};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = InMemoryNetwork::new();
//!     let membership = StaticMembership::new(ClusterView::new(1, vec![1]));
//!
//!     let grid = DataGrid::new(GridConfig::new(1), membership, network.transport(1))?;
//!     network.register(1, grid.message_handler());
//!
//!     let users = grid.cache("users");
//!     users.put("user:123", "Alice").await?;
//!     assert_eq!(users.get("user:123").await?.as_deref(), Some(&b"Alice"[..]));
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                DataGrid / GridCache / services               │
//! │      put · get · remove · Lock · StrongCounter · WeakCounter │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TriangleDispatcher                         │
//! │  origin ──forward──▶ primary ──backup──▶ backups              │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//! ┌───────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │ VersionStore  │   │ PartitionMonitor │   │   LocalStorage   │
//! │ + SeenCommands│   │ + MergeCoordinator│  │   (Moka)         │
//! └───────────────┘   └──────────────────┘   └──────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Writes**: ordered per key by the primary; versions never go backwards
//! - **Reads**: served by the primary owner
//! - **Retries**: idempotent, command ids are remembered by every owner

pub mod cache;
pub mod cluster;
pub mod config;
pub mod counter;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod functions;
pub mod lock;
pub mod metrics;
pub mod network;
pub mod partition;
pub mod partitioning;
pub mod rebalancing;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use cache::storage::{LocalStorage, MokaStorage};
pub use cache::{DataGrid, GridCache};
pub use config::{
    AckPolicy, GridConfig, LockServiceConfig, PartitionConfig, PartitionHandling,
    ReplicationConfig, ReplicationMode, RetryConfig, StorageConfig,
};
pub use error::{CounterError, DistributionError, Error, LockError, Result};
pub use types::{
    CacheEntry, CommandId, EntryKey, EntryMetadata, GridStats, NodeId, TopologyId, Version,
    WriteCommand, WriteKind, WriteResult,
};

// Re-export cluster types
pub use cluster::{ClusterView, MembershipProvider, StaticMembership, ViewChange};

// Re-export network types
pub use network::{InMemoryNetwork, MessageHandler, NetworkServer, TcpTransport, Transport};

// Re-export partition handling types
pub use partition::{MergePolicy, MergePolicyConfig, MergeReport, PartitionState};

// Re-export coordination services
pub use counter::{
    CounterConfig, CounterEvent, CounterKind, CounterService, CounterState, StrongCounter,
    WeakCounter,
};
pub use lock::{Lock, LockConfig, LockOwnership, LockService};

// Re-export events and functions
pub use events::{EntryEvent, EntryEventKind, EventOrigin, Listener, Subscription};
pub use functions::{EntryFunction, FunctionResult};

pub use metrics::{GridMetrics, MetricsSnapshot};
