//! Scan requests as they arrive from outside the engine.
//!
//! A request is checked with [`Validate::validate`] before it is turned into
//! a [`ScanPlan`]. Invalid requests never reach the traversal engine.

use crate::btree::{Direction, Key, KeyRange, KeyRangeError, MAX_KEY_SIZE};
use crate::scan::ScanPlan;

/// Largest batch a client may ask for.
pub const MAX_BATCH_SIZE: usize = 4096;

/// Well-formedness check for an incoming message.
pub trait Validate {
    /// Check the message without side effects.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    fn validate(&self) -> Result<(), ValidationError>;
}

/// A range scan request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRequest {
    /// First key to consider (inclusive).
    pub start: Vec<u8>,
    /// End of the range; `None` scans to the end of the tree.
    pub end: Option<Vec<u8>>,
    /// Whether `end` itself is part of the range.
    pub inclusive_end: bool,
    /// Deliver keys in descending order.
    pub reverse: bool,
    pub limit: Option<usize>,
    pub batch_size: Option<usize>,
}

impl ScanRequest {
    /// Scan everything from `start` onwards.
    #[must_use]
    pub fn from_key(start: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            ..Self::default()
        }
    }

    /// The requested key range.
    ///
    /// # Errors
    ///
    /// Returns an error if the request does not validate.
    pub fn range(&self) -> Result<KeyRange, ValidationError> {
        self.validate()?;
        let left = Key::new(self.start.as_slice());
        let range = match (&self.end, self.inclusive_end) {
            (None, _) => KeyRange::at_least(left),
            (Some(end), false) => KeyRange::half_open(left, end.as_slice())?,
            (Some(end), true) => KeyRange::closed(left, end.as_slice())?,
        };
        Ok(range)
    }

    /// The requested direction.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        if self.reverse {
            Direction::Backward
        } else {
            Direction::Forward
        }
    }

    /// Turn a valid request into a scan plan.
    ///
    /// # Errors
    ///
    /// Returns an error if the request does not validate.
    pub fn to_plan(&self) -> Result<ScanPlan, ValidationError> {
        let mut plan = ScanPlan::new(self.range()?, self.direction());
        if let Some(limit) = self.limit {
            plan = plan.with_limit(limit);
        }
        if let Some(batch_size) = self.batch_size {
            plan = plan.with_batch_size(batch_size);
        }
        Ok(plan)
    }
}

impl Validate for ScanRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.start.len() > MAX_KEY_SIZE {
            return Err(ValidationError::KeyTooLong {
                field: "start",
                len: self.start.len(),
            });
        }
        if let Some(end) = &self.end {
            if end.len() > MAX_KEY_SIZE {
                return Err(ValidationError::KeyTooLong {
                    field: "end",
                    len: end.len(),
                });
            }
            if self.start > *end {
                return Err(ValidationError::InvertedRange);
            }
        } else if self.inclusive_end {
            return Err(ValidationError::InclusiveWithoutEnd);
        }
        if self.limit == Some(0) {
            return Err(ValidationError::ZeroLimit);
        }
        match self.batch_size {
            Some(0) => return Err(ValidationError::BatchSizeOutOfRange(0)),
            Some(size) if size > MAX_BATCH_SIZE => {
                return Err(ValidationError::BatchSizeOutOfRange(size));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Error returned when a request is malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A key is longer than the engine stores.
    KeyTooLong { field: &'static str, len: usize },
    /// `start` sorts after `end`.
    InvertedRange,
    /// `inclusive_end` was set on an unbounded request.
    InclusiveWithoutEnd,
    /// A limit of zero was requested.
    ZeroLimit,
    /// The batch size is zero or above [`MAX_BATCH_SIZE`].
    BatchSizeOutOfRange(usize),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyTooLong { field, len } => write!(
                f,
                "{field} key is {len} bytes; the maximum is {MAX_KEY_SIZE}"
            ),
            Self::InvertedRange => write!(f, "start key sorts after end key"),
            Self::InclusiveWithoutEnd => write!(f, "inclusive_end requires an end key"),
            Self::ZeroLimit => write!(f, "limit must be at least 1"),
            Self::BatchSizeOutOfRange(size) => write!(
                f,
                "batch size {size} is out of range (1-{MAX_BATCH_SIZE})"
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<KeyRangeError> for ValidationError {
    fn from(_: KeyRangeError) -> Self {
        Self::InvertedRange
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_request_scans_everything() {
        let request = ScanRequest::default();
        assert!(request.validate().is_ok());
        assert_eq!(request.range().expect("range"), KeyRange::universe());
        assert_eq!(request.direction(), Direction::Forward);
    }

    #[test]
    fn test_end_bounds() {
        let exclusive = ScanRequest {
            end: Some(b"m".to_vec()),
            ..ScanRequest::from_key("c")
        };
        let range = exclusive.range().expect("range");
        assert!(range.contains(b"c"));
        assert!(range.contains(b"lzz"));
        assert!(!range.contains(b"m"));

        let inclusive = ScanRequest {
            inclusive_end: true,
            ..exclusive
        };
        let range = inclusive.range().expect("range");
        assert!(range.contains(b"m"));
        assert!(!range.contains(b"m\0"));
    }

    #[test]
    fn test_equal_start_and_end_is_empty_not_invalid() {
        let request = ScanRequest {
            end: Some(b"k".to_vec()),
            ..ScanRequest::from_key("k")
        };
        assert!(request.range().expect("range").is_empty());
    }

    #[test]
    fn test_rejects_malformed_requests() {
        let inverted = ScanRequest {
            end: Some(b"a".to_vec()),
            ..ScanRequest::from_key("b")
        };
        assert_eq!(inverted.validate(), Err(ValidationError::InvertedRange));

        let dangling = ScanRequest {
            inclusive_end: true,
            ..ScanRequest::default()
        };
        assert_eq!(
            dangling.validate(),
            Err(ValidationError::InclusiveWithoutEnd)
        );

        let zero = ScanRequest {
            limit: Some(0),
            ..ScanRequest::default()
        };
        assert_eq!(zero.validate(), Err(ValidationError::ZeroLimit));

        let huge_batch = ScanRequest {
            batch_size: Some(MAX_BATCH_SIZE + 1),
            ..ScanRequest::default()
        };
        assert_eq!(
            huge_batch.to_plan(),
            Err(ValidationError::BatchSizeOutOfRange(MAX_BATCH_SIZE + 1))
        );

        let long_key = ScanRequest::from_key(vec![b'k'; MAX_KEY_SIZE + 1]);
        assert_eq!(
            long_key.validate(),
            Err(ValidationError::KeyTooLong {
                field: "start",
                len: MAX_KEY_SIZE + 1
            })
        );
    }

    #[test]
    fn test_to_plan_carries_options() {
        let request = ScanRequest {
            reverse: true,
            limit: Some(10),
            batch_size: Some(3),
            ..ScanRequest::from_key("a")
        };
        let plan = request.to_plan().expect("plan");
        assert_eq!(plan.direction, Direction::Backward);
        assert_eq!(plan.limit, Some(10));
        assert_eq!(plan.batch_size, 3);
        assert_eq!(plan.range, KeyRange::at_least("a"));
    }

    #[test]
    fn test_validation_error_display() {
        assert_eq!(
            ValidationError::ZeroLimit.to_string(),
            "limit must be at least 1"
        );
        assert_eq!(
            ValidationError::BatchSizeOutOfRange(0).to_string(),
            "batch size 0 is out of range (1-4096)"
        );
    }
}
