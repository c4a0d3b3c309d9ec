//! Replicated lock state and its transitions.
//!
//! The whole lock, holder, reentrancy count and FIFO waiter queue, is stored
//! as the value of one entry. Every transition runs as a functional command at
//! the primary owner, so the queue order is the order in which requests reached
//! the primary.

use crate::error::StorageError;
use crate::functions::{decode_value, encode_value, EntryWrite, FunctionOutcome, FunctionResult};
use crate::types::{CacheEntry, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Identity a lock is held by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner {
    /// Member holding the lock.
    pub node: NodeId,
    /// Lock handle on that member; zero for node-level ownership.
    pub instance: u64,
}

/// One acquisition request, identified by a ticket unique on its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Waiter {
    /// Requesting identity.
    pub owner: LockOwner,
    /// Per-node request ticket.
    pub ticket: u64,
}

/// State of one lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    /// Request currently holding the lock.
    pub holder: Option<Waiter>,
    /// Reentrancy count of the holder.
    pub count: u32,
    /// Requests waiting, in arrival order.
    pub waiters: VecDeque<Waiter>,
}

impl LockState {
    /// Decode the state stored in an entry; an absent entry is unlocked.
    pub fn from_entry(entry: Option<&CacheEntry>) -> Result<Self, StorageError> {
        match entry {
            Some(e) => decode_value(e),
            None => Ok(Self::default()),
        }
    }

    /// Whether anyone holds the lock.
    pub fn is_locked(&self) -> bool {
        self.holder.is_some()
    }

    /// Whether the given identity holds the lock.
    pub fn is_held_by(&self, owner: &LockOwner) -> bool {
        self.holder.map(|h| h.owner == *owner).unwrap_or(false)
    }

    fn position(&self, waiter: &Waiter) -> Option<usize> {
        self.waiters.iter().position(|w| w == waiter)
    }

    /// Hand the lock to the next waiter, if any.
    fn grant_next(&mut self) -> Option<Waiter> {
        self.holder = self.waiters.pop_front();
        self.count = if self.holder.is_some() { 1 } else { 0 };
        self.holder
    }
}

/// A lock transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockOp {
    /// Acquire, optionally joining the queue when the lock is busy.
    Acquire {
        waiter: Waiter,
        reentrant: bool,
        enqueue: bool,
    },
    /// Release one level of the holder's reentrancy.
    Release { owner: LockOwner },
    /// Withdraw a queued request.
    Cancel {
        waiter: Waiter,
        release_if_granted: bool,
    },
    /// Drop holders and waiters that left the cluster.
    ForceRelease { departed: Vec<NodeId> },
}

/// Result of a lock transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockReply {
    /// The request holds the lock.
    Acquired { count: u32 },
    /// The request joined (or already sits in) the queue.
    Queued { position: usize },
    /// The lock is held and the request did not queue.
    Busy,
    /// The holder re-acquired a non-reentrant lock.
    NotReentrant,
    /// The holder released one level; `granted` is the next holder, if handed off.
    Released {
        remaining: u32,
        granted: Option<Waiter>,
    },
    /// The caller does not hold the lock.
    NotOwner,
    /// The queued request was withdrawn.
    Cancelled,
    /// The request was granted before it could be withdrawn.
    AlreadyGranted,
    /// The request was neither queued nor holding.
    NotQueued,
    /// Nothing changed.
    Unchanged,
}

impl LockOp {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            LockOp::Acquire { .. } => "lock_acquire",
            LockOp::Release { .. } => "lock_release",
            LockOp::Cancel { .. } => "lock_cancel",
            LockOp::ForceRelease { .. } => "lock_force_release",
        }
    }

    /// Apply the transition to the current lock entry.
    pub fn apply(&self, current: Option<&CacheEntry>) -> Result<FunctionOutcome, StorageError> {
        let mut state = LockState::from_entry(current)?;
        let (changed, reply) = self.transition(&mut state);

        let write = if changed {
            EntryWrite::Set {
                value: encode_value(&state),
                metadata: current.map(|e| e.metadata).unwrap_or_default(),
            }
        } else {
            EntryWrite::Keep
        };

        Ok(FunctionOutcome {
            write,
            result: FunctionResult::Lock(reply),
        })
    }

    /// Mutate `state`, returning whether it changed and the reply.
    pub fn transition(&self, state: &mut LockState) -> (bool, LockReply) {
        match self {
            LockOp::Acquire {
                waiter,
                reentrant,
                enqueue,
            } => {
                match state.holder {
                    None => {
                        // An unlocked lock never has waiters: release always hands off.
                        state.waiters.retain(|w| w != waiter);
                        state.holder = Some(*waiter);
                        state.count = 1;
                        (true, LockReply::Acquired { count: 1 })
                    }
                    Some(holder) if holder == *waiter => {
                        (false, LockReply::Acquired { count: state.count })
                    }
                    Some(holder) if holder.owner == waiter.owner && *reentrant => {
                        state.count += 1;
                        (true, LockReply::Acquired { count: state.count })
                    }
                    // Instance-level owners would queue behind themselves forever.
                    Some(holder)
                        if holder.owner == waiter.owner && waiter.owner.instance != 0 =>
                    {
                        (false, LockReply::NotReentrant)
                    }
                    Some(_) => {
                        if let Some(position) = state.position(waiter) {
                            (false, LockReply::Queued { position })
                        } else if *enqueue {
                            state.waiters.push_back(*waiter);
                            (
                                true,
                                LockReply::Queued {
                                    position: state.waiters.len() - 1,
                                },
                            )
                        } else {
                            (false, LockReply::Busy)
                        }
                    }
                }
            }
            LockOp::Release { owner } => match state.holder {
                Some(holder) if holder.owner == *owner => {
                    state.count = state.count.saturating_sub(1);
                    if state.count > 0 {
                        return (
                            true,
                            LockReply::Released {
                                remaining: state.count,
                                granted: None,
                            },
                        );
                    }
                    let granted = state.grant_next();
                    (
                        true,
                        LockReply::Released {
                            remaining: 0,
                            granted,
                        },
                    )
                }
                _ => (false, LockReply::NotOwner),
            },
            LockOp::Cancel {
                waiter,
                release_if_granted,
            } => {
                if let Some(position) = state.position(waiter) {
                    state.waiters.remove(position);
                    return (true, LockReply::Cancelled);
                }
                if state.holder == Some(*waiter) {
                    if *release_if_granted {
                        let granted = state.grant_next();
                        return (
                            true,
                            LockReply::Released {
                                remaining: 0,
                                granted,
                            },
                        );
                    }
                    return (false, LockReply::AlreadyGranted);
                }
                (false, LockReply::NotQueued)
            }
            LockOp::ForceRelease { departed } => {
                let before = state.waiters.len();
                state.waiters.retain(|w| !departed.contains(&w.owner.node));
                let changed = state.waiters.len() != before;

                let holder_departed = state
                    .holder
                    .map(|h| departed.contains(&h.owner.node))
                    .unwrap_or(false);
                if holder_departed {
                    let granted = state.grant_next();
                    return (
                        true,
                        LockReply::Released {
                            remaining: 0,
                            granted,
                        },
                    );
                }
                (changed, LockReply::Unchanged)
            }
        }
    }
}
