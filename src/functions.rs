//! Functional write commands.
//!
//! A functional command is evaluated by the primary against the current value
//! of the key. Its outcome is either a new value, a removal, or no change, plus
//! a return value for the caller. Lock and counter operations are expressed as
//! functions so that they run inside the primary's per-key critical section.

use crate::counter::state::{CounterOp, CounterReply};
use crate::error::StorageError;
use crate::lock::state::{LockOp, LockReply};
use crate::types::{CacheEntry, EntryMetadata};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A deterministic function applied to a single entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryFunction {
    /// Insert the value only if the key is absent.
    PutIfAbsent { value: Bytes, metadata: EntryMetadata },
    /// Lock state transition.
    Lock(LockOp),
    /// Counter update.
    Counter(CounterOp),
}

/// Value returned by a functional command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionResult {
    /// Whether `PutIfAbsent` inserted.
    Inserted(bool),
    /// Lock transition result.
    Lock(LockReply),
    /// Counter update result.
    Counter(CounterReply),
}

/// Effect of a function on the stored entry.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryWrite {
    /// Leave the entry untouched.
    Keep,
    /// Store a new value.
    Set { value: Bytes, metadata: EntryMetadata },
    /// Delete the entry.
    Remove,
}

/// Effect and return value of a function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionOutcome {
    /// What to do with the entry.
    pub write: EntryWrite,
    /// What to return to the caller.
    pub result: FunctionResult,
}

impl EntryFunction {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            EntryFunction::PutIfAbsent { .. } => "put_if_absent",
            EntryFunction::Lock(op) => op.name(),
            EntryFunction::Counter(op) => op.name(),
        }
    }

    /// Commutative functions are replicated as the function itself rather than
    /// as the primary's post-image.
    pub fn is_commutative(&self) -> bool {
        matches!(self, EntryFunction::Counter(op) if op.is_commutative())
    }

    /// Evaluate the function against the current entry.
    pub fn apply(&self, current: Option<&CacheEntry>) -> Result<FunctionOutcome, StorageError> {
        match self {
            EntryFunction::PutIfAbsent { value, metadata } => Ok(match current {
                Some(_) => FunctionOutcome {
                    write: EntryWrite::Keep,
                    result: FunctionResult::Inserted(false),
                },
                None => FunctionOutcome {
                    write: EntryWrite::Set {
                        value: value.clone(),
                        metadata: *metadata,
                    },
                    result: FunctionResult::Inserted(true),
                },
            }),
            EntryFunction::Lock(op) => op.apply(current),
            EntryFunction::Counter(op) => op.apply(current),
        }
    }
}

/// Encode a typed value stored inside an entry.
pub(crate) fn encode_value<T: Serialize>(value: &T) -> Bytes {
    // Serializing plain structs into a Vec cannot fail.
    Bytes::from(bincode::serialize(value).unwrap_or_default())
}

/// Decode a typed value stored inside an entry.
pub(crate) fn decode_value<T: for<'de> Deserialize<'de>>(
    entry: &CacheEntry,
) -> Result<T, StorageError> {
    bincode::deserialize(&entry.value).map_err(|e| StorageError::Corrupt {
        key: entry.key.to_string(),
        reason: e.to_string(),
    })
}
