//! Stored counter record and the counter update functions.

use crate::error::StorageError;
use crate::functions::{decode_value, encode_value, EntryWrite, FunctionOutcome, FunctionResult};
use crate::types::CacheEntry;
use serde::{Deserialize, Serialize};

/// Counter value together with its bounds.
///
/// Bounds travel with the value so the primary can enforce them and classify
/// boundary crossings without consulting the counter definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    /// Current value.
    pub value: i64,
    /// Inclusive lower bound.
    pub lower: Option<i64>,
    /// Inclusive upper bound.
    pub upper: Option<i64>,
}

/// Position of a counter value relative to its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterState {
    /// Strictly inside the bounds.
    Valid,
    /// At the lower bound.
    LowerBoundReached,
    /// At the upper bound.
    UpperBoundReached,
}

impl CounterRecord {
    /// Unbounded record.
    pub fn unbounded(value: i64) -> Self {
        Self {
            value,
            lower: None,
            upper: None,
        }
    }

    /// Decode the record stored in an entry, or fall back to `init`.
    pub fn from_entry(entry: Option<&CacheEntry>, init: &Self) -> Result<Self, StorageError> {
        match entry {
            Some(e) => decode_value(e),
            None => Ok(*init),
        }
    }

    /// Whether `value` lies within the bounds.
    pub fn admits(&self, value: i64) -> bool {
        self.lower.map_or(true, |l| value >= l) && self.upper.map_or(true, |u| value <= u)
    }

    /// Classify a value against the bounds.
    pub fn state_of(&self, value: i64) -> CounterState {
        if self.lower == Some(value) {
            CounterState::LowerBoundReached
        } else if self.upper == Some(value) {
            CounterState::UpperBoundReached
        } else {
            CounterState::Valid
        }
    }

    /// Classify the current value.
    pub fn state(&self) -> CounterState {
        self.state_of(self.value)
    }

    fn with_value(&self, value: i64) -> Self {
        Self { value, ..*self }
    }
}

/// A counter update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterOp {
    /// Strong compare-and-swap.
    CompareAndSwap {
        expected: i64,
        update: i64,
        init: CounterRecord,
    },
    /// Strong bounded addition.
    Add { delta: i64, init: CounterRecord },
    /// Weak commutative addition, replicated as the delta.
    WeakAdd { delta: i64, init: CounterRecord },
}

/// Result of a counter update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterReply {
    /// The value changed (or was confirmed) from `previous` to `current`.
    Updated { previous: i64, current: i64 },
    /// Compare-and-swap lost.
    CasFailed { current: i64 },
    /// The update would leave the bounds.
    BoundsExceeded { current: i64 },
}

impl CounterOp {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            CounterOp::CompareAndSwap { .. } => "counter_cas",
            CounterOp::Add { .. } => "counter_add",
            CounterOp::WeakAdd { .. } => "counter_weak_add",
        }
    }

    /// Weak additions commute with each other.
    pub fn is_commutative(&self) -> bool {
        matches!(self, CounterOp::WeakAdd { .. })
    }

    /// Apply the update to the current counter entry.
    pub fn apply(&self, current: Option<&CacheEntry>) -> Result<FunctionOutcome, StorageError> {
        let init = match self {
            CounterOp::CompareAndSwap { init, .. }
            | CounterOp::Add { init, .. }
            | CounterOp::WeakAdd { init, .. } => init,
        };
        let record = CounterRecord::from_entry(current, init)?;
        let (next, reply) = self.evaluate(&record);

        let write = match next {
            Some(next) => EntryWrite::Set {
                value: encode_value(&next),
                metadata: current.map(|e| e.metadata).unwrap_or_default(),
            },
            None => EntryWrite::Keep,
        };

        Ok(FunctionOutcome {
            write,
            result: FunctionResult::Counter(reply),
        })
    }

    /// Compute the next record, `None` when nothing is written.
    pub fn evaluate(&self, record: &CounterRecord) -> (Option<CounterRecord>, CounterReply) {
        let current = record.value;
        match self {
            CounterOp::CompareAndSwap {
                expected, update, ..
            } => {
                if current != *expected {
                    (None, CounterReply::CasFailed { current })
                } else if !record.admits(*update) {
                    (None, CounterReply::BoundsExceeded { current })
                } else {
                    (
                        Some(record.with_value(*update)),
                        CounterReply::Updated {
                            previous: current,
                            current: *update,
                        },
                    )
                }
            }
            CounterOp::Add { delta, .. } => match current.checked_add(*delta) {
                Some(next) if record.admits(next) => (
                    Some(record.with_value(next)),
                    CounterReply::Updated {
                        previous: current,
                        current: next,
                    },
                ),
                _ => (None, CounterReply::BoundsExceeded { current }),
            },
            CounterOp::WeakAdd { delta, .. } => {
                // Wrapping keeps additions commutative at the extremes.
                let next = current.wrapping_add(*delta);
                (
                    Some(record.with_value(next)),
                    CounterReply::Updated {
                        previous: current,
                        current: next,
                    },
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounded(value: i64, lower: i64, upper: i64) -> CounterRecord {
        CounterRecord {
            value,
            lower: Some(lower),
            upper: Some(upper),
        }
    }

    #[test]
    fn test_cas_success_and_failure() {
        let record = CounterRecord::unbounded(0);
        let op = CounterOp::CompareAndSwap {
            expected: 0,
            update: 1,
            init: record,
        };

        let (next, reply) = op.evaluate(&record);
        assert_eq!(next.map(|r| r.value), Some(1));
        assert_eq!(
            reply,
            CounterReply::Updated {
                previous: 0,
                current: 1
            }
        );

        let (next, reply) = op.evaluate(&CounterRecord::unbounded(1));
        assert!(next.is_none());
        assert_eq!(reply, CounterReply::CasFailed { current: 1 });
    }

    #[test]
    fn test_add_respects_bounds() {
        let record = bounded(8, 0, 10);
        let op = CounterOp::Add {
            delta: 3,
            init: record,
        };
        let (next, reply) = op.evaluate(&record);
        assert!(next.is_none());
        assert_eq!(reply, CounterReply::BoundsExceeded { current: 8 });

        let op = CounterOp::Add {
            delta: 2,
            init: record,
        };
        let (next, _) = op.evaluate(&record);
        let next = next.unwrap();
        assert_eq!(next.value, 10);
        assert_eq!(next.state(), CounterState::UpperBoundReached);
    }

    #[test]
    fn test_add_overflow_is_bounds_exceeded() {
        let record = CounterRecord::unbounded(i64::MAX);
        let op = CounterOp::Add {
            delta: 1,
            init: record,
        };
        assert_eq!(
            op.evaluate(&record).1,
            CounterReply::BoundsExceeded { current: i64::MAX }
        );
    }

    #[test]
    fn test_cas_outside_bounds() {
        let record = bounded(5, 0, 10);
        let op = CounterOp::CompareAndSwap {
            expected: 5,
            update: 11,
            init: record,
        };
        assert_eq!(
            op.evaluate(&record).1,
            CounterReply::BoundsExceeded { current: 5 }
        );
    }

    #[test]
    fn test_weak_add_is_commutative() {
        let start = CounterRecord::unbounded(0);
        let deltas = [3, -1, 2];

        let forward = deltas.iter().fold(start, |r, d| {
            CounterOp::WeakAdd { delta: *d, init: start }
                .evaluate(&r)
                .0
                .unwrap()
        });
        let backward = deltas.iter().rev().fold(start, |r, d| {
            CounterOp::WeakAdd { delta: *d, init: start }
                .evaluate(&r)
                .0
                .unwrap()
        });

        assert_eq!(forward.value, 4);
        assert_eq!(forward, backward);
        assert!(CounterOp::WeakAdd { delta: 1, init: start }.is_commutative());
    }

    #[test]
    fn test_state_classification() {
        let record = bounded(0, 0, 3);
        assert_eq!(record.state(), CounterState::LowerBoundReached);
        assert_eq!(record.state_of(1), CounterState::Valid);
        assert_eq!(record.state_of(3), CounterState::UpperBoundReached);
        assert!(record.admits(3));
        assert!(!record.admits(4));
    }
}
