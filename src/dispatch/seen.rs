//! Bounded memory of applied commands.
//!
//! Both primaries and backups remember what they applied per command id, so a
//! redelivered backup is acknowledged without re-applying and a retried write
//! reaching a new primary replays the original result.

use crate::network::rpc::BackupPayload;
use crate::types::{CommandId, Version, WriteResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// What a node applied for a command.
#[derive(Debug, Clone)]
pub struct AppliedCommand {
    /// Result returned to the caller.
    pub result: WriteResult,
    /// Version the write was sequenced at.
    pub version: Option<Version>,
    /// What was (or would be) sent to backups; `None` if nothing changed.
    pub payload: Option<BackupPayload>,
}

#[derive(Debug, Default)]
struct Inner {
    applied: HashMap<CommandId, AppliedCommand>,
    order: VecDeque<CommandId>,
}

/// FIFO-bounded map of applied commands.
#[derive(Debug)]
pub struct SeenCommands {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl SeenCommands {
    /// Create with room for `capacity` commands.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The recorded outcome of a command.
    pub fn get(&self, id: &CommandId) -> Option<AppliedCommand> {
        self.inner.lock().applied.get(id).cloned()
    }

    /// Whether the command was applied here.
    pub fn contains(&self, id: &CommandId) -> bool {
        self.inner.lock().applied.contains_key(id)
    }

    /// Record a command, evicting the oldest once full.
    pub fn remember(&self, id: CommandId, applied: AppliedCommand) {
        let mut inner = self.inner.lock();
        if inner.applied.insert(id, applied).is_none() {
            inner.order.push_back(id);
        }
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.applied.remove(&oldest);
            }
        }
    }

    /// Number of remembered commands.
    pub fn len(&self) -> usize {
        self.inner.lock().applied.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied() -> AppliedCommand {
        AppliedCommand {
            result: WriteResult {
                previous: None,
                version: Some(Version::new(1, 1)),
                modified: true,
                function: None,
            },
            version: Some(Version::new(1, 1)),
            payload: Some(BackupPayload::Tombstone),
        }
    }

    #[test]
    fn test_remember_and_get() {
        let seen = SeenCommands::new(4);
        let id = CommandId::new(1, 1);
        assert!(!seen.contains(&id));

        seen.remember(id, applied());
        assert!(seen.contains(&id));
        assert_eq!(seen.get(&id).unwrap().version, Some(Version::new(1, 1)));
    }

    #[test]
    fn test_evicts_oldest() {
        let seen = SeenCommands::new(2);
        for seq in 1..=3 {
            seen.remember(CommandId::new(1, seq), applied());
        }
        assert_eq!(seen.len(), 2);
        assert!(!seen.contains(&CommandId::new(1, 1)));
        assert!(seen.contains(&CommandId::new(1, 3)));

        // Re-remembering does not duplicate the order slot.
        seen.remember(CommandId::new(1, 3), applied());
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&CommandId::new(1, 2)));
    }
}
