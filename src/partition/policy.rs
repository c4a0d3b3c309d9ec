//! Merge policies.
//!
//! A policy is a pure function of a [`ConflictEntry`]: given the same
//! divergent copies it always returns the same resolution, which makes a
//! restarted merge converge to the same result.

use crate::partition::merge::ConflictEntry;
use crate::types::EntryMetadata;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// How a conflict is settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Write this value to every owner.
    Value { value: Bytes, metadata: EntryMetadata },
    /// Remove the key everywhere.
    Tombstone,
}

/// Deterministic conflict resolver.
pub trait MergePolicy: Send + Sync + 'static {
    /// Policy name for logs.
    fn name(&self) -> &str;

    /// Resolve a conflict.
    fn resolve(&self, conflict: &ConflictEntry) -> Resolution;
}

/// The preferred partition's copy wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferredPartition;

impl MergePolicy for PreferredPartition {
    fn name(&self) -> &str {
        "preferred_partition"
    }

    fn resolve(&self, conflict: &ConflictEntry) -> Resolution {
        conflict
            .preferred()
            .map(|copy| copy.resolution())
            .unwrap_or(Resolution::Tombstone)
    }
}

/// A non-null copy wins over a removal; between non-null copies the
/// partition ordering decides.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferredNonNull;

impl MergePolicy for PreferredNonNull {
    fn name(&self) -> &str {
        "preferred_non_null"
    }

    fn resolve(&self, conflict: &ConflictEntry) -> Resolution {
        conflict
            .copies
            .iter()
            .find(|copy| copy.value.is_some())
            .map(|copy| copy.resolution())
            .unwrap_or(Resolution::Tombstone)
    }
}

/// Every conflicting key is removed.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveAll;

impl MergePolicy for RemoveAll {
    fn name(&self) -> &str {
        "remove_all"
    }

    fn resolve(&self, _conflict: &ConflictEntry) -> Resolution {
        Resolution::Tombstone
    }
}

/// Merge policy selection.
#[derive(Clone)]
pub enum MergePolicyConfig {
    /// See [`PreferredPartition`].
    PreferredPartition,
    /// See [`PreferredNonNull`].
    PreferredNonNull,
    /// See [`RemoveAll`].
    RemoveAll,
    /// Application-supplied policy.
    Custom(Arc<dyn MergePolicy>),
}

impl MergePolicyConfig {
    /// Instantiate the policy.
    pub fn build(&self) -> Arc<dyn MergePolicy> {
        match self {
            MergePolicyConfig::PreferredPartition => Arc::new(PreferredPartition),
            MergePolicyConfig::PreferredNonNull => Arc::new(PreferredNonNull),
            MergePolicyConfig::RemoveAll => Arc::new(RemoveAll),
            MergePolicyConfig::Custom(policy) => policy.clone(),
        }
    }
}

impl fmt::Debug for MergePolicyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergePolicyConfig::PreferredPartition => f.write_str("PreferredPartition"),
            MergePolicyConfig::PreferredNonNull => f.write_str("PreferredNonNull"),
            MergePolicyConfig::RemoveAll => f.write_str("RemoveAll"),
            MergePolicyConfig::Custom(policy) => write!(f, "Custom({})", policy.name()),
        }
    }
}
