//! Distributed Lock.
//!
//! A lock is one entry in the internal `__locks` cache holding the full
//! [`LockState`]: holder, reentrancy count and FIFO queue. Every transition is
//! a functional command executed by the key's primary, so acquisition order is
//! the order in which requests reached the primary and the queue survives a
//! primary crash on the backups.
//!
//! When a release hands the lock to the head of the queue, the primary's entry
//! listener notifies the waiter's node. Waiters also re-read the state
//! periodically in case a notification was lost to a failover.

pub mod state;

use crate::cache::context::NodeContext;
use crate::dispatch::TriangleDispatcher;
use crate::error::{Error, LockError, Result};
use crate::events::{EntryEvent, EventOrigin, Subscription};
use crate::functions::{decode_value, encode_value, EntryFunction, FunctionResult};
use crate::network::rpc::{LockNotification, Message};
use crate::types::{EntryKey, EntryMetadata, NodeId, WriteCommand, WriteResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub use state::{LockOp, LockOwner, LockReply, LockState, Waiter};

/// Internal cache holding lock states.
pub const LOCKS_CACHE: &str = "__locks";

/// Internal cache holding lock definitions.
pub const LOCK_CONFIGS_CACHE: &str = "__lock_configs";

/// Identity a lock is held by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LockOwnership {
    /// Every handle on a member shares ownership.
    #[default]
    Node,
    /// Each handle is its own owner.
    Instance,
}

/// Definition of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LockConfig {
    /// Ownership granularity.
    pub ownership: LockOwnership,
    /// Whether the owner may acquire the lock again while holding it.
    pub reentrant: bool,
}

impl LockConfig {
    /// Set the ownership granularity.
    pub fn with_ownership(mut self, ownership: LockOwnership) -> Self {
        self.ownership = ownership;
        self
    }

    /// Set reentrancy.
    pub fn with_reentrant(mut self, reentrant: bool) -> Self {
        self.reentrant = reentrant;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockSignal {
    Granted,
    Removed,
}

struct PendingGrant {
    lock: String,
    tx: oneshot::Sender<LockSignal>,
}

struct Shared {
    ctx: Arc<NodeContext>,
    dispatcher: Arc<TriangleDispatcher>,
    pending: DashMap<Waiter, PendingGrant>,
    next_ticket: AtomicU64,
    next_instance: AtomicU64,
}

impl Shared {
    async fn submit(&self, key: &EntryKey, function: EntryFunction) -> Result<WriteResult> {
        let command =
            WriteCommand::functional(self.ctx.next_command_id(), key.cache.clone(), function);
        self.dispatcher.submit(command, key.clone()).await
    }

    async fn lock_op(&self, key: &EntryKey, op: LockOp) -> Result<LockReply> {
        let result = self.submit(key, EntryFunction::Lock(op)).await?;
        match result.function {
            Some(FunctionResult::Lock(reply)) => Ok(reply),
            other => Err(Error::Internal(format!("unexpected lock result {:?}", other))),
        }
    }

    async fn read_state(&self, key: &EntryKey) -> Result<Option<LockState>> {
        match self.dispatcher.read(key).await? {
            Some(entry) => Ok(Some(decode_value(&entry)?)),
            None => Ok(None),
        }
    }

    /// Wake a local waiter.
    fn signal(&self, waiter: &Waiter, signal: LockSignal) {
        if let Some((_, pending)) = self.pending.remove(waiter) {
            trace!(
                node_id = self.ctx.node_id,
                lock = %pending.lock,
                ticket = waiter.ticket,
                signal = ?signal,
                "Waking lock waiter"
            );
            let _ = pending.tx.send(signal);
        }
    }

    /// Deliver a signal to the waiter's node.
    fn notify(&self, lock: String, waiter: Waiter, signal: LockSignal) {
        if waiter.owner.node == self.ctx.node_id {
            self.signal(&waiter, signal);
            return;
        }
        let transport = self.ctx.transport.clone();
        let node_id = self.ctx.node_id;
        let msg = Message::LockNotification(LockNotification {
            lock,
            waiter,
            removed: signal == LockSignal::Removed,
        });
        tokio::spawn(async move {
            if let Err(e) = transport.request(waiter.owner.node, msg).await {
                debug!(
                    node_id,
                    target = waiter.owner.node,
                    error = %e,
                    "Lock notification lost"
                );
            }
        });
    }
}

/// Observe lock transitions at the primary and notify granted waiters.
fn on_lock_event(shared: &Weak<Shared>, event: &EntryEvent) {
    if event.origin != EventOrigin::Primary {
        return;
    }
    let Some(shared) = shared.upgrade() else {
        return;
    };

    let decode = |bytes: &bytes::Bytes| bincode::deserialize::<LockState>(bytes);
    let previous = match event.previous.as_ref().map(decode).transpose() {
        Ok(state) => state.unwrap_or_default(),
        Err(e) => {
            warn!(key = %event.key, error = %e, "Undecodable lock state");
            return;
        }
    };
    let lock = String::from_utf8_lossy(&event.key.key).into_owned();

    match event.value.as_ref().map(decode).transpose() {
        Ok(Some(state)) => {
            if let Some(holder) = state.holder {
                if state.holder != previous.holder && previous.waiters.contains(&holder) {
                    shared.notify(lock, holder, LockSignal::Granted);
                }
            }
        }
        Ok(None) => {
            for waiter in previous.waiters {
                shared.notify(lock.clone(), waiter, LockSignal::Removed);
            }
        }
        Err(e) => warn!(key = %event.key, error = %e, "Undecodable lock state"),
    }
}

/// Lock definitions and handles of one node.
pub struct LockService {
    shared: Arc<Shared>,
    _subscription: Subscription,
}

impl LockService {
    /// Create the service and start observing lock transitions.
    pub fn new(ctx: Arc<NodeContext>, dispatcher: Arc<TriangleDispatcher>) -> Self {
        let shared = Arc::new(Shared {
            ctx,
            dispatcher,
            pending: DashMap::new(),
            next_ticket: AtomicU64::new(0),
            next_instance: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&shared);
        let subscription = shared.ctx.events.subscribe(
            LOCKS_CACHE,
            Arc::new(move |event: &EntryEvent| on_lock_event(&weak, event)),
        );
        Self {
            shared,
            _subscription: subscription,
        }
    }

    fn config_key(name: &str) -> EntryKey {
        EntryKey::new(LOCK_CONFIGS_CACHE, name.as_bytes().to_vec())
    }

    fn lock_key(name: &str) -> EntryKey {
        EntryKey::new(LOCKS_CACHE, name.as_bytes().to_vec())
    }

    /// Define a lock. Returns `false` if it was already defined.
    pub async fn define_lock(&self, name: &str, config: LockConfig) -> Result<bool> {
        let result = self
            .shared
            .submit(
                &Self::config_key(name),
                EntryFunction::PutIfAbsent {
                    value: encode_value(&config),
                    metadata: EntryMetadata::default(),
                },
            )
            .await?;
        let defined = matches!(result.function, Some(FunctionResult::Inserted(true)));
        debug!(
            node_id = self.shared.ctx.node_id,
            lock = name,
            defined,
            "Define lock"
        );
        Ok(defined)
    }

    /// Whether a lock is defined.
    pub async fn is_defined(&self, name: &str) -> Result<bool> {
        Ok(self.shared.dispatcher.read(&Self::config_key(name)).await?.is_some())
    }

    /// A handle on a defined lock.
    pub async fn get_lock(&self, name: &str) -> Result<Lock> {
        let entry = self
            .shared
            .dispatcher
            .read(&Self::config_key(name))
            .await?
            .ok_or_else(|| LockError::Undefined(name.to_string()))?;
        let config: LockConfig = decode_value(&entry)?;

        let instance = match config.ownership {
            LockOwnership::Node => 0,
            LockOwnership::Instance => self.shared.next_instance.fetch_add(1, Ordering::Relaxed) + 1,
        };
        Ok(Lock {
            shared: self.shared.clone(),
            name: name.to_string(),
            key: Self::lock_key(name),
            config,
            owner: LockOwner {
                node: self.shared.ctx.node_id,
                instance,
            },
        })
    }

    /// Remove a lock definition and its state. Waiters fail with
    /// [`LockError::Deleted`].
    pub async fn remove_lock(&self, name: &str) -> Result<bool> {
        let ctx = &self.shared.ctx;
        let removed = self
            .shared
            .dispatcher
            .submit(
                WriteCommand::remove(ctx.next_command_id(), LOCK_CONFIGS_CACHE),
                Self::config_key(name),
            )
            .await?
            .modified;
        self.shared
            .dispatcher
            .submit(
                WriteCommand::remove(ctx.next_command_id(), LOCKS_CACHE),
                Self::lock_key(name),
            )
            .await?;
        debug!(node_id = ctx.node_id, lock = name, removed, "Remove lock");
        Ok(removed)
    }

    /// Handle a grant or removal notification from a lock's primary.
    pub fn handle_notification(&self, notification: LockNotification) {
        let signal = if notification.removed {
            LockSignal::Removed
        } else {
            LockSignal::Granted
        };
        self.shared.signal(&notification.waiter, signal);
    }

    /// Release locks held or awaited by departed members, for every lock this
    /// node is primary of.
    pub async fn release_departed(&self, departed: &[NodeId]) -> Result<usize> {
        let ctx = &self.shared.ctx;
        let mut released = 0;
        for entry in ctx.storage.entries(LOCKS_CACHE) {
            let (_, owners) = ctx.owners(&entry.key);
            if owners.first() != Some(&ctx.node_id) {
                continue;
            }
            let state: LockState = decode_value(&entry)?;
            let involved = state
                .holder
                .iter()
                .chain(state.waiters.iter())
                .any(|w| departed.contains(&w.owner.node));
            if !involved {
                continue;
            }

            let reply = self
                .shared
                .lock_op(
                    &entry.key,
                    LockOp::ForceRelease {
                        departed: departed.to_vec(),
                    },
                )
                .await?;
            warn!(
                node_id = ctx.node_id,
                lock = %entry.key,
                departed = ?departed,
                reply = ?reply,
                "Released lock of departed members"
            );
            released += 1;
        }
        Ok(released)
    }

    /// Number of local requests waiting for a grant.
    pub fn pending_waiters(&self) -> usize {
        self.shared.pending.len()
    }
}

impl std::fmt::Debug for LockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockService")
            .field("node_id", &self.shared.ctx.node_id)
            .field("pending", &self.shared.pending.len())
            .finish()
    }
}

/// Withdraws a request whose acquisition did not complete.
struct PendingWait {
    shared: Arc<Shared>,
    key: EntryKey,
    waiter: Waiter,
    armed: bool,
}

impl PendingWait {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.waiter);
        if !self.armed {
            return;
        }
        // The future was dropped mid-wait: the request may still be queued or
        // even granted, and must not strand the lock.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = self.shared.clone();
        let key = self.key.clone();
        let waiter = self.waiter;
        handle.spawn(async move {
            let op = LockOp::Cancel {
                waiter,
                release_if_granted: true,
            };
            if let Err(e) = shared.lock_op(&key, op).await {
                warn!(
                    node_id = shared.ctx.node_id,
                    lock = %key,
                    ticket = waiter.ticket,
                    error = %e,
                    "Failed to withdraw abandoned lock request"
                );
            }
        });
    }
}

/// Handle on one distributed lock.
pub struct Lock {
    shared: Arc<Shared>,
    name: String,
    key: EntryKey,
    config: LockConfig,
    owner: LockOwner,
}

impl Lock {
    /// Lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock definition.
    pub fn config(&self) -> LockConfig {
        self.config
    }

    /// Identity this handle acquires as.
    pub fn owner(&self) -> LockOwner {
        self.owner
    }

    /// Acquire the lock, waiting as long as it takes.
    pub async fn lock(&self) -> Result<()> {
        self.acquire(None).await
    }

    /// Acquire the lock within `timeout`.
    ///
    /// A zero timeout never queues. Fails with [`LockError::Timeout`].
    pub async fn try_lock(&self, timeout: Duration) -> Result<()> {
        self.acquire(Some(timeout)).await
    }

    /// Release one level of ownership.
    pub async fn unlock(&self) -> Result<()> {
        let op = LockOp::Release { owner: self.owner };
        match self.shared.lock_op(&self.key, op).await? {
            LockReply::Released { remaining, granted } => {
                debug!(
                    node_id = self.shared.ctx.node_id,
                    lock = %self.name,
                    remaining,
                    granted = ?granted.map(|w| w.owner.node),
                    "Unlocked"
                );
                Ok(())
            }
            _ => Err(LockError::NotOwner(self.name.clone()).into()),
        }
    }

    /// Whether anyone holds the lock.
    pub async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .shared
            .read_state(&self.key)
            .await?
            .map_or(false, |s| s.is_locked()))
    }

    /// Whether this handle's identity holds the lock.
    pub async fn is_locked_by_me(&self) -> Result<bool> {
        Ok(self
            .shared
            .read_state(&self.key)
            .await?
            .map_or(false, |s| s.is_held_by(&self.owner)))
    }

    async fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        let started = Instant::now();
        let shared = &self.shared;
        let waiter = Waiter {
            owner: self.owner,
            ticket: shared.next_ticket.fetch_add(1, Ordering::Relaxed) + 1,
        };
        let enqueue = timeout.map_or(true, |t| !t.is_zero());

        // Registered before submitting: the grant may arrive before the reply.
        let (tx, mut rx) = oneshot::channel();
        shared.pending.insert(
            waiter,
            PendingGrant {
                lock: self.name.clone(),
                tx,
            },
        );
        let mut pending = PendingWait {
            shared: shared.clone(),
            key: self.key.clone(),
            waiter,
            armed: true,
        };

        let acquire = LockOp::Acquire {
            waiter,
            reentrant: self.config.reentrant,
            enqueue,
        };
        match shared.lock_op(&self.key, acquire).await? {
            LockReply::Acquired { count } => {
                pending.disarm();
                self.granted(count);
                return Ok(());
            }
            LockReply::Queued { position } => {
                debug!(
                    node_id = shared.ctx.node_id,
                    lock = %self.name,
                    ticket = waiter.ticket,
                    position,
                    "Waiting for lock"
                );
            }
            LockReply::NotReentrant => {
                pending.disarm();
                return Err(LockError::NotReentrant(self.name.clone()).into());
            }
            LockReply::Busy => {
                pending.disarm();
                return Err(self.timed_out(started));
            }
            other => {
                pending.disarm();
                return Err(Error::Internal(format!("unexpected lock reply {:?}", other)));
            }
        }

        let wait = self.wait_for_grant(waiter, &mut rx);
        let outcome = match timeout {
            Some(t) => tokio::time::timeout(t.saturating_sub(started.elapsed()), wait)
                .await
                .ok(),
            None => Some(wait.await),
        };

        match outcome {
            Some(Ok(())) => {
                pending.disarm();
                self.granted(1);
                Ok(())
            }
            Some(Err(e)) => {
                if matches!(e, Error::Lock(LockError::Deleted(_))) {
                    pending.disarm();
                }
                Err(e)
            }
            None => {
                let cancel = LockOp::Cancel {
                    waiter,
                    release_if_granted: false,
                };
                let reply = shared.lock_op(&self.key, cancel).await?;
                pending.disarm();
                if reply == LockReply::AlreadyGranted {
                    self.granted(1);
                    return Ok(());
                }
                Err(self.timed_out(started))
            }
        }
    }

    async fn wait_for_grant(
        &self,
        waiter: Waiter,
        rx: &mut oneshot::Receiver<LockSignal>,
    ) -> Result<()> {
        let recheck = self.shared.ctx.config.locks.recheck_interval;
        let mut listening = true;
        loop {
            tokio::select! {
                signal = &mut *rx, if listening => match signal {
                    Ok(LockSignal::Granted) => return Ok(()),
                    Ok(LockSignal::Removed) => {
                        return Err(LockError::Deleted(self.name.clone()).into())
                    }
                    Err(_) => listening = false,
                },
                _ = tokio::time::sleep(recheck) => {}
            }

            // Notifications can be lost when the primary fails over.
            let state = match self.shared.read_state(&self.key).await? {
                Some(state) => state,
                None => {
                    if !self.defined().await? {
                        return Err(LockError::Deleted(self.name.clone()).into());
                    }
                    LockState::default()
                }
            };
            if state.holder == Some(waiter) {
                return Ok(());
            }
            if !state.waiters.contains(&waiter) {
                let op = LockOp::Acquire {
                    waiter,
                    reentrant: self.config.reentrant,
                    enqueue: true,
                };
                match self.shared.lock_op(&self.key, op).await? {
                    LockReply::Acquired { .. } => return Ok(()),
                    LockReply::NotReentrant => {
                        return Err(LockError::NotReentrant(self.name.clone()).into())
                    }
                    _ => {}
                }
            }
        }
    }

    async fn defined(&self) -> Result<bool> {
        let key = LockService::config_key(&self.name);
        Ok(self.shared.dispatcher.read(&key).await?.is_some())
    }

    fn granted(&self, count: u32) {
        self.shared.ctx.metrics.lock_grants.inc();
        debug!(
            node_id = self.shared.ctx.node_id,
            lock = %self.name,
            count,
            "Lock acquired"
        );
    }

    fn timed_out(&self, started: Instant) -> Error {
        self.shared.ctx.metrics.lock_timeouts.inc();
        LockError::Timeout {
            name: self.name.clone(),
            waited_ms: started.elapsed().as_millis() as u64,
        }
        .into()
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("owner", &self.owner)
            .finish()
    }
}
