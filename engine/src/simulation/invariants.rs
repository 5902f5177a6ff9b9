//! Invariant checking for deterministic simulation testing.
//!
//! Every simulated traversal is compared against the key model the tree was
//! built from. A traversal may fail under injected faults, but whatever it
//! delivered before failing must still be a correct, ordered prefix.

// Simulation code legitimately needs cloning for test data
#![allow(clippy::disallowed_methods)]

use crate::btree::{Direction, KeyRange, TraversalError, TraversalOutcome};

/// Most locks a traversal may hold at once: a parent and a child.
pub const MAX_LOCKS_HELD: usize = 2;

/// The value stored for `key` when a tree is generated.
#[must_use]
pub fn value_for(key: &[u8]) -> Vec<u8> {
    let mut value = b"value-".to_vec();
    value.extend_from_slice(key);
    value
}

/// Whether `value` was written for `key`, either at load time or by a
/// concurrent rewrite (which appends a generation suffix).
#[must_use]
pub fn value_matches(key: &[u8], value: &[u8]) -> bool {
    value.starts_with(&value_for(key))
}

/// Everything observed about one traversal.
#[derive(Debug)]
pub struct TraversalRecord<'a> {
    pub range: &'a KeyRange,
    pub direction: Direction,
    /// The callback returned false on this many-th pair.
    pub stop_after: Option<usize>,
    pub delivered: &'a [(Vec<u8>, Vec<u8>)],
    pub result: &'a Result<TraversalOutcome, TraversalError>,
    /// Locks the transaction still held once the traversal returned.
    pub locks_held_after: usize,
    pub peak_locks_held: usize,
}

/// A detected invariant violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    /// Description of the violation.
    pub description: String,
    /// Index of the traversal that exposed it.
    pub operation_index: usize,
    /// Additional context.
    pub context: String,
}

/// Checks traversal results against the expected key sequence.
#[derive(Debug, Default)]
pub struct InvariantChecker {
    violations: Vec<InvariantViolation>,
    /// Errors are legitimate when faults are being injected.
    allow_errors: bool,
}

impl InvariantChecker {
    /// A checker that treats every traversal error as a violation.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            violations: Vec::new(),
            allow_errors: false,
        }
    }

    /// A checker that accepts traversal errors.
    #[must_use]
    pub const fn allowing_errors() -> Self {
        Self {
            violations: Vec::new(),
            allow_errors: true,
        }
    }

    /// An empty checker with the same error policy.
    #[must_use]
    pub const fn empty_like(&self) -> Self {
        Self {
            violations: Vec::new(),
            allow_errors: self.allow_errors,
        }
    }

    #[must_use]
    pub fn violations(&self) -> &[InvariantViolation] {
        &self.violations
    }

    #[must_use]
    pub const fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    pub fn add_violation(&mut self, violation: InvariantViolation) {
        self.violations.push(violation);
    }

    fn violation(&mut self, operation_index: usize, description: &str, record: &TraversalRecord<'_>) {
        self.violations.push(InvariantViolation {
            description: description.to_string(),
            operation_index,
            context: format!(
                "range={} direction={:?} stop_after={:?} delivered={} result={:?}",
                record.range,
                record.direction,
                record.stop_after,
                record.delivered.len(),
                record.result
            ),
        });
    }

    /// Check one traversal. `expected` holds every key of the model in
    /// `record.range`, in `record.direction` order.
    pub fn check_traversal(
        &mut self,
        operation_index: usize,
        record: &TraversalRecord<'_>,
        expected: &[Vec<u8>],
    ) {
        let delivered = record.delivered;

        if let Some((key, _)) = delivered.iter().find(|(key, _)| !record.range.contains(key)) {
            let description = format!("key {} outside the requested range", key.escape_ascii());
            self.violation(operation_index, &description, record);
        }

        for (i, pair) in delivered.windows(2).enumerate() {
            let (prev, next) = (&pair[0].0, &pair[1].0);
            let ordered = match record.direction {
                Direction::Forward => prev < next,
                Direction::Backward => prev > next,
            };
            if prev == next {
                let description = format!("duplicate key {} at {}", next.escape_ascii(), i + 1);
                self.violation(operation_index, &description, record);
            } else if !ordered {
                let description = format!("key order broken at {}", i + 1);
                self.violation(operation_index, &description, record);
            }
        }

        if let Some((key, _)) = delivered
            .iter()
            .find(|(key, value)| !value_matches(key, value))
        {
            let description = format!("value does not belong to key {}", key.escape_ascii());
            self.violation(operation_index, &description, record);
        }

        let diverges = delivered.len() > expected.len()
            || delivered
                .iter()
                .zip(expected)
                .any(|((key, _), expected)| key != expected);
        if diverges {
            self.violation(operation_index, "delivered keys are not a prefix of the model", record);
        }

        let stop_reached = record
            .stop_after
            .is_some_and(|n| n <= expected.len());
        match record.result {
            Ok(TraversalOutcome::Completed) => {
                if stop_reached {
                    self.violation(operation_index, "completed after the callback stopped", record);
                } else if delivered.len() != expected.len() {
                    self.violation(operation_index, "completed without delivering every key", record);
                }
            }
            Ok(TraversalOutcome::Stopped) => {
                if !stop_reached || record.stop_after != Some(delivered.len()) {
                    self.violation(operation_index, "stopped without a stop request", record);
                }
            }
            Err(_) => {
                if !self.allow_errors {
                    self.violation(operation_index, "unexpected traversal error", record);
                }
                if record.stop_after == Some(delivered.len()) {
                    self.violation(operation_index, "failed after the callback stopped", record);
                }
            }
        }

        if record.locks_held_after != 0 {
            let description = format!("{} locks held after traversal", record.locks_held_after);
            self.violation(operation_index, &description, record);
        }
        if record.peak_locks_held > MAX_LOCKS_HELD {
            let description = format!("{} locks held at once", record.peak_locks_held);
            self.violation(operation_index, &description, record);
        }
    }
}
