//! Local entry storage.
//!
//! The grid keeps each owned copy in a [`LocalStorage`]. The default backend
//! is Moka, with per-entry expiry driven by the entry's lifespan. Entries of
//! internal caches (lock and counter state) bypass Moka entirely: they are
//! neither expired nor evicted.

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::types::{CacheEntry, EntryKey, INTERNAL_CACHE_PREFIX};
use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;
use moka::Expiry;
use std::time::{Duration, Instant};

/// Storage of the entries this node holds a copy of.
#[async_trait]
pub trait LocalStorage: Send + Sync + 'static {
    /// Read an entry.
    async fn get(&self, key: &EntryKey) -> Result<Option<CacheEntry>, StorageError>;

    /// Insert or overwrite an entry.
    async fn put(&self, entry: CacheEntry) -> Result<(), StorageError>;

    /// Remove an entry, returning it if present.
    async fn remove(&self, key: &EntryKey) -> Result<Option<CacheEntry>, StorageError>;

    /// Entries of one cache.
    fn entries(&self, cache: &str) -> Vec<CacheEntry>;

    /// Every entry held locally.
    fn all_entries(&self) -> Vec<CacheEntry>;

    /// Number of entries held locally.
    fn entry_count(&self) -> u64;

    /// Run pending maintenance (expiry, eviction).
    async fn run_pending_tasks(&self) {}
}

/// Expires an entry after its lifespan, or the configured default.
struct LifespanExpiry {
    default_lifespan: Option<Duration>,
}

impl LifespanExpiry {
    fn lifespan_of(&self, entry: &CacheEntry) -> Option<Duration> {
        entry.metadata.lifespan().or(self.default_lifespan)
    }
}

impl Expiry<EntryKey, CacheEntry> for LifespanExpiry {
    fn expire_after_create(
        &self,
        _key: &EntryKey,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        self.lifespan_of(value)
    }

    fn expire_after_update(
        &self,
        _key: &EntryKey,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        self.lifespan_of(value)
    }
}

/// Moka-backed local storage.
pub struct MokaStorage {
    cache: Cache<EntryKey, CacheEntry>,
    internal: DashMap<EntryKey, CacheEntry>,
}

impl MokaStorage {
    /// Create a storage with the given configuration.
    pub fn new(config: &StorageConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(LifespanExpiry {
                default_lifespan: config.default_lifespan,
            })
            .build();
        Self {
            cache,
            internal: DashMap::new(),
        }
    }
}

#[async_trait]
impl LocalStorage for MokaStorage {
    async fn get(&self, key: &EntryKey) -> Result<Option<CacheEntry>, StorageError> {
        if key.is_internal() {
            return Ok(self.internal.get(key).map(|e| e.value().clone()));
        }
        Ok(self.cache.get(key).await)
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), StorageError> {
        if entry.key.is_internal() {
            self.internal.insert(entry.key.clone(), entry);
            return Ok(());
        }
        self.cache.insert(entry.key.clone(), entry).await;
        Ok(())
    }

    async fn remove(&self, key: &EntryKey) -> Result<Option<CacheEntry>, StorageError> {
        if key.is_internal() {
            return Ok(self.internal.remove(key).map(|(_, e)| e));
        }
        Ok(self.cache.remove(key).await)
    }

    fn entries(&self, cache: &str) -> Vec<CacheEntry> {
        if cache.starts_with(INTERNAL_CACHE_PREFIX) {
            return self
                .internal
                .iter()
                .filter(|e| e.key().cache == cache)
                .map(|e| e.value().clone())
                .collect();
        }
        self.cache
            .iter()
            .filter(|(k, _)| k.cache == cache)
            .map(|(_, v)| v)
            .collect()
    }

    fn all_entries(&self) -> Vec<CacheEntry> {
        self.cache
            .iter()
            .map(|(_, v)| v)
            .chain(self.internal.iter().map(|e| e.value().clone()))
            .collect()
    }

    fn entry_count(&self) -> u64 {
        // Moka's own count lags behind pending tasks.
        (self.cache.iter().count() + self.internal.len()) as u64
    }

    async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

impl std::fmt::Debug for MokaStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaStorage")
            .field("entry_count", &self.entry_count())
            .finish()
    }
}
