//! Metrics for the write path, merges and coordination primitives.
//!
//! Counters are plain atomics updated on the hot path; `snapshot()` copies
//! them into a value that can be logged or asserted on.
//!
//! ```rust,ignore
//! let metrics = GridMetrics::new();
//! metrics.writes.inc();
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.writes, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics of one grid node.
#[derive(Debug)]
pub struct GridMetrics {
    /// Writes sequenced by this node as primary.
    pub writes: Counter,
    /// Writes that failed at this node as primary.
    pub write_failures: Counter,
    /// Writes forwarded to a remote primary.
    pub forwards: Counter,
    /// Backup messages sent.
    pub backups_sent: Counter,
    /// Backup acknowledgments received.
    pub backup_acks: Counter,
    /// Backup commands applied on this node.
    pub backups_applied: Counter,
    /// Transient failures retried.
    pub retries: Counter,
    /// Commands recognised as already applied.
    pub duplicates_suppressed: Counter,
    /// Backup commands rejected for topology mismatch.
    pub topology_rejections: Counter,
    /// Conflicts found by merges coordinated here.
    pub conflicts_detected: Counter,
    /// Conflicts committed by merges coordinated here.
    pub conflicts_resolved: Counter,
    /// Entries pushed to new owners after view changes.
    pub entries_transferred: Counter,
    /// Lock grants observed by local waiters.
    pub lock_grants: Counter,
    /// Lock waits that timed out.
    pub lock_timeouts: Counter,
    /// Compare-and-set operations that lost.
    pub cas_failures: Counter,
}

impl Default for GridMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GridMetrics {
    /// Create a zeroed metrics set.
    pub fn new() -> Self {
        Self {
            writes: Counter::new("grid_writes_total"),
            write_failures: Counter::new("grid_write_failures_total"),
            forwards: Counter::new("grid_forwards_total"),
            backups_sent: Counter::new("grid_backups_sent_total"),
            backup_acks: Counter::new("grid_backup_acks_total"),
            backups_applied: Counter::new("grid_backups_applied_total"),
            retries: Counter::new("grid_retries_total"),
            duplicates_suppressed: Counter::new("grid_duplicates_suppressed_total"),
            topology_rejections: Counter::new("grid_topology_rejections_total"),
            conflicts_detected: Counter::new("grid_merge_conflicts_detected_total"),
            conflicts_resolved: Counter::new("grid_merge_conflicts_resolved_total"),
            entries_transferred: Counter::new("grid_entries_transferred_total"),
            lock_grants: Counter::new("grid_lock_grants_total"),
            lock_timeouts: Counter::new("grid_lock_timeouts_total"),
            cas_failures: Counter::new("grid_counter_cas_failures_total"),
        }
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            writes: self.writes.get(),
            write_failures: self.write_failures.get(),
            forwards: self.forwards.get(),
            backups_sent: self.backups_sent.get(),
            backup_acks: self.backup_acks.get(),
            backups_applied: self.backups_applied.get(),
            retries: self.retries.get(),
            duplicates_suppressed: self.duplicates_suppressed.get(),
            topology_rejections: self.topology_rejections.get(),
            conflicts_detected: self.conflicts_detected.get(),
            conflicts_resolved: self.conflicts_resolved.get(),
            entries_transferred: self.entries_transferred.get(),
            lock_grants: self.lock_grants.get(),
            lock_timeouts: self.lock_timeouts.get(),
            cas_failures: self.cas_failures.get(),
        }
    }

    /// All counters with their names, for export.
    pub fn counters(&self) -> [&Counter; 15] {
        [
            &self.writes,
            &self.write_failures,
            &self.forwards,
            &self.backups_sent,
            &self.backup_acks,
            &self.backups_applied,
            &self.retries,
            &self.duplicates_suppressed,
            &self.topology_rejections,
            &self.conflicts_detected,
            &self.conflicts_resolved,
            &self.entries_transferred,
            &self.lock_grants,
            &self.lock_timeouts,
            &self.cas_failures,
        ]
    }
}

/// Point-in-time copy of [`GridMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub writes: u64,
    pub write_failures: u64,
    pub forwards: u64,
    pub backups_sent: u64,
    pub backup_acks: u64,
    pub backups_applied: u64,
    pub retries: u64,
    pub duplicates_suppressed: u64,
    pub topology_rejections: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub entries_transferred: u64,
    pub lock_grants: u64,
    pub lock_timeouts: u64,
    pub cas_failures: u64,
}
