//! Entry Version Store.
//!
//! Tracks the version of every key this node holds or has held a copy of.
//! Versions of removed keys are kept as tombstones so that a removal can win
//! over an older value during replication and merges.

use crate::types::{EntryKey, TopologyId, Version};
use dashmap::DashMap;

/// Outcome of offering a version to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionMerge {
    /// The offered version is newer and was recorded.
    Accepted,
    /// The store already holds an equal or newer version.
    Conflict { current: Version },
}

/// Per-key version stamps.
#[derive(Debug, Default)]
pub struct VersionStore {
    versions: DashMap<EntryKey, Version>,
}

impl VersionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version of a key.
    pub fn get(&self, key: &EntryKey) -> Option<Version> {
        self.versions.get(key).map(|v| *v)
    }

    /// Version a write sequenced in `generation` would receive.
    ///
    /// Nothing is recorded: the caller records the version once the write is
    /// durable locally.
    pub fn next(&self, key: &EntryKey, generation: TopologyId) -> Version {
        match self.get(key) {
            Some(current) => current.successor(generation),
            None => Version::new(generation, 1),
        }
    }

    /// Whether `version` is strictly newer than the stored one, without
    /// recording it. Callers hold the key lock until they [`merge`] the
    /// version once the copy is written.
    ///
    /// [`merge`]: VersionStore::merge
    pub fn admits(&self, key: &EntryKey, version: Version) -> VersionMerge {
        match self.get(key) {
            Some(current) if version <= current => VersionMerge::Conflict { current },
            _ => VersionMerge::Accepted,
        }
    }

    /// Record `version` if it is strictly newer than the stored one.
    pub fn merge(&self, key: &EntryKey, version: Version) -> VersionMerge {
        let mut slot = self.versions.entry(key.clone()).or_default();
        if version > *slot {
            *slot = version;
            VersionMerge::Accepted
        } else {
            VersionMerge::Conflict { current: *slot }
        }
    }

    /// Record a version unconditionally.
    pub fn record(&self, key: &EntryKey, version: Version) {
        self.versions.insert(key.clone(), version);
    }

    /// Keys whose version was sequenced in `generation` or later.
    pub fn touched_since(&self, generation: TopologyId) -> Vec<EntryKey> {
        self.versions
            .iter()
            .filter(|e| e.value().generation >= generation)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Keys whose version was sequenced before `generation`.
    pub fn older_than(&self, generation: TopologyId) -> Vec<EntryKey> {
        self.versions
            .iter()
            .filter(|e| e.value().generation < generation)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Every key with a version.
    pub fn keys(&self) -> Vec<EntryKey> {
        self.versions.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop the version of a key this node no longer owns.
    pub fn forget(&self, key: &EntryKey) {
        self.versions.remove(key);
    }

    /// Number of versioned keys.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Whether no key is versioned.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
