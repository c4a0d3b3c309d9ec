//! Entry change notifications.
//!
//! Listeners are registered per cache and invoked synchronously after a write
//! is applied locally, on the primary and on every backup. They run inside the
//! key's critical section, so they must not block or write to the grid.

use crate::types::{EntryKey, Version};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Where the change was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// Applied by the primary owner.
    Primary,
    /// Applied on a backup copy.
    Backup,
    /// Installed by state transfer or merge.
    Transfer,
}

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryEventKind {
    /// The key did not exist before.
    Created,
    /// The value changed.
    Modified,
    /// The key was removed.
    Removed,
}

/// A change to one entry.
#[derive(Debug, Clone)]
pub struct EntryEvent {
    pub key: EntryKey,
    pub kind: EntryEventKind,
    pub value: Option<Bytes>,
    pub previous: Option<Bytes>,
    pub version: Version,
    pub origin: EventOrigin,
}

impl EntryEvent {
    /// Build an event from the before and after values.
    pub fn new(
        key: EntryKey,
        previous: Option<Bytes>,
        value: Option<Bytes>,
        version: Version,
        origin: EventOrigin,
    ) -> Self {
        let kind = match (&previous, &value) {
            (_, None) => EntryEventKind::Removed,
            (None, Some(_)) => EntryEventKind::Created,
            (Some(_), Some(_)) => EntryEventKind::Modified,
        };
        Self {
            key,
            kind,
            value,
            previous,
            version,
            origin,
        }
    }
}

/// Callback invoked for every event of a cache.
pub type Listener = Arc<dyn Fn(&EntryEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    listeners: DashMap<String, Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

/// Per-cache listener registry.
#[derive(Clone, Default)]
pub struct EventRegistry {
    inner: Arc<Registry>,
}

impl EventRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for a cache.
    pub fn subscribe(&self, cache: impl Into<String>, listener: Listener) -> Subscription {
        let cache = cache.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .entry(cache.clone())
            .or_default()
            .push((id, listener));
        Subscription {
            registry: self.inner.clone(),
            cache,
            id,
        }
    }

    /// Deliver an event to the listeners of its cache.
    pub fn fire(&self, event: &EntryEvent) {
        // Clone out so listeners may subscribe or cancel without deadlocking.
        let listeners: Vec<Listener> = match self.inner.listeners.get(&event.key.cache) {
            Some(list) => list.iter().map(|(_, l)| l.clone()).collect(),
            None => return,
        };
        for listener in listeners {
            listener(event);
        }
    }

    /// Number of listeners on a cache.
    pub fn listener_count(&self, cache: &str) -> usize {
        self.inner
            .listeners
            .get(cache)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("caches", &self.inner.listeners.len())
            .finish()
    }
}

/// Handle of a registered listener.
pub struct Subscription {
    registry: Arc<Registry>,
    cache: String,
    id: u64,
}

impl Subscription {
    /// Remove the listener.
    pub fn cancel(self) {
        if let Some(mut list) = self.registry.listeners.get_mut(&self.cache) {
            list.retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("cache", &self.cache)
            .field("id", &self.id)
            .finish()
    }
}
