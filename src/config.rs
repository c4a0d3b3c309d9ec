//! Configuration types for a grid node.

use crate::partition::policy::MergePolicyConfig;
use crate::types::NodeId;
use std::time::Duration;

/// Main configuration for a grid node.
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Number of owners per key (primary plus backups).
    pub num_owners: usize,

    /// Virtual nodes per member on the ownership ring.
    pub vnodes_per_node: usize,

    /// Replication configuration.
    pub replication: ReplicationConfig,

    /// Partition handling configuration.
    pub partition: PartitionConfig,

    /// Local storage configuration.
    pub storage: StorageConfig,

    /// Lock service configuration.
    pub locks: LockServiceConfig,

    /// How many applied command ids each node remembers for duplicate suppression.
    pub seen_commands_capacity: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            num_owners: 2,
            vnodes_per_node: 64,
            replication: ReplicationConfig::default(),
            partition: PartitionConfig::default(),
            storage: StorageConfig::default(),
            locks: LockServiceConfig::default(),
            seen_commands_capacity: 65_536,
        }
    }
}

impl GridConfig {
    /// Create a configuration for the given node.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Set the number of owners per key.
    pub fn with_num_owners(mut self, num_owners: usize) -> Self {
        self.num_owners = num_owners;
        self
    }

    /// Set the replication configuration.
    pub fn with_replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }

    /// Set the replication mode.
    pub fn with_replication_mode(mut self, mode: ReplicationMode) -> Self {
        self.replication.mode = mode;
        self
    }

    /// Set the partition configuration.
    pub fn with_partition(mut self, partition: PartitionConfig) -> Self {
        self.partition = partition;
        self
    }

    /// Set the partition handling strategy.
    pub fn with_partition_handling(mut self, handling: PartitionHandling) -> Self {
        self.partition.handling = handling;
        self
    }

    /// Set the merge policy.
    pub fn with_merge_policy(mut self, policy: MergePolicyConfig) -> Self {
        self.partition.merge_policy = policy;
        self
    }

    /// Set the storage configuration.
    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Set the lock service configuration.
    pub fn with_locks(mut self, locks: LockServiceConfig) -> Self {
        self.locks = locks;
        self
    }

    /// Check the configuration for values the node cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.num_owners == 0 {
            return Err("num_owners must be at least 1".to_string());
        }
        if self.vnodes_per_node == 0 {
            return Err("vnodes_per_node must be at least 1".to_string());
        }
        if self.replication.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.seen_commands_capacity == 0 {
            return Err("seen_commands_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}

/// How the primary waits for backups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// The caller's result resolves after the required acknowledgments.
    Sync,
    /// The caller's result resolves after the local apply.
    Async,
}

/// How many backups must acknowledge a synchronous write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Every backup.
    All,
    /// Enough backups for a majority of owners, counting the primary.
    Majority,
}

impl AckPolicy {
    /// Required backup acknowledgments for a key with `owners` owners.
    pub fn required_acks(&self, owners: usize) -> usize {
        let backups = owners.saturating_sub(1);
        match self {
            AckPolicy::All => backups,
            AckPolicy::Majority => (owners / 2 + 1).saturating_sub(1).min(backups),
        }
    }
}

/// Replication configuration.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Sync or async replication.
    pub mode: ReplicationMode,

    /// Ack requirement in sync mode.
    pub ack_policy: AckPolicy,

    /// Timeout for a single backup round trip.
    pub backup_timeout: Duration,

    /// Retry policy for transient failures.
    pub retry: RetryConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            mode: ReplicationMode::Sync,
            ack_policy: AckPolicy::All,
            backup_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Set the ack policy.
    pub fn with_ack_policy(mut self, ack_policy: AckPolicy) -> Self {
        self.ack_policy = ack_policy;
        self
    }

    /// Set the backup timeout.
    pub fn with_backup_timeout(mut self, timeout: Duration) -> Self {
        self.backup_timeout = timeout;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Backoff before the first retry.
    pub initial_backoff: Duration,

    /// Backoff cap.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(1000),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// What a partition does once it lost members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionHandling {
    /// Keep serving reads and writes.
    PreferAvailability,
    /// Reject reads and writes while split.
    DenyReadWrites,
    /// Serve reads, reject writes while split.
    AllowReads,
}

/// Partition handling configuration.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Behaviour of a partition that lost members.
    pub handling: PartitionHandling,

    /// Policy resolving conflicts on merge.
    pub merge_policy: MergePolicyConfig,

    /// How long ordinary writes wait for a merge to finish.
    pub merge_wait_timeout: Duration,

    /// Timeout for state requests issued by the merge coordinator.
    pub state_request_timeout: Duration,

    /// Attempts of a merge before the coordinator gives up until the next view.
    pub merge_attempts: u32,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            handling: PartitionHandling::PreferAvailability,
            merge_policy: MergePolicyConfig::PreferredNonNull,
            merge_wait_timeout: Duration::from_secs(10),
            state_request_timeout: Duration::from_secs(5),
            merge_attempts: 3,
        }
    }
}

/// Local storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Maximum number of entries held locally.
    pub max_capacity: u64,

    /// Lifespan applied to entries written without one.
    pub default_lifespan: Option<Duration>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1_000_000,
            default_lifespan: None,
        }
    }
}

/// Lock service configuration.
#[derive(Debug, Clone)]
pub struct LockServiceConfig {
    /// How often a waiting request re-reads the lock state in case a grant
    /// notification was lost.
    pub recheck_interval: Duration,
}

impl Default for LockServiceConfig {
    fn default() -> Self {
        Self {
            recheck_interval: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GridConfig::default();
        assert_eq!(config.node_id, 1);
        assert_eq!(config.num_owners, 2);
        assert_eq!(config.replication.mode, ReplicationMode::Sync);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = GridConfig::new(42)
            .with_num_owners(3)
            .with_replication_mode(ReplicationMode::Async)
            .with_partition_handling(PartitionHandling::DenyReadWrites);

        assert_eq!(config.node_id, 42);
        assert_eq!(config.num_owners, 3);
        assert_eq!(config.replication.mode, ReplicationMode::Async);
        assert_eq!(config.partition.handling, PartitionHandling::DenyReadWrites);
    }

    #[test]
    fn test_invalid_config() {
        let config = GridConfig::new(1).with_num_owners(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_required_acks() {
        assert_eq!(AckPolicy::All.required_acks(3), 2);
        assert_eq!(AckPolicy::Majority.required_acks(3), 1);
        assert_eq!(AckPolicy::Majority.required_acks(2), 1);
        assert_eq!(AckPolicy::Majority.required_acks(5), 2);
        assert_eq!(AckPolicy::All.required_acks(1), 0);
        assert_eq!(AckPolicy::Majority.required_acks(1), 0);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let retry = RetryConfig {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(10));
        assert_eq!(retry.backoff(2), Duration::from_millis(20));
        assert_eq!(retry.backoff(3), Duration::from_millis(40));
        assert_eq!(retry.backoff(8), Duration::from_millis(100));
        assert_eq!(retry.backoff(64), Duration::from_millis(100));
    }
}
