//! Keys and key ranges.
//!
//! Keys are raw byte strings ordered lexicographically (the order of
//! `[u8]`). A [`KeyRange`] has an inclusive left bound and an exclusive or
//! unbounded right bound; ranges are validated at construction, so every
//! range the traversal engine sees is well formed.
//!
//! # Invariants
//!
//! - A range built by a public constructor satisfies `left <= right`.
//! - A range with `right == Exclusive(left)` is empty and contains nothing.

use std::borrow::Borrow;
use std::cmp::Ordering;

/// Maximum key size in bytes.
pub const MAX_KEY_SIZE: usize = 250;

/// Compare two keys in tree order.
#[must_use]
pub fn compare(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// An owned key.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Vec<u8>);

impl Key {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The smallest key (the empty byte string).
    #[must_use]
    pub const fn min() -> Self {
        Self(Vec::new())
    }

    /// The key's bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the key, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the empty key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The smallest key strictly greater than `self` (`self` followed by a
    /// zero byte).
    #[must_use]
    pub fn successor(&self) -> Self {
        let mut bytes = Vec::with_capacity(self.0.len() + 1);
        bytes.extend_from_slice(&self.0);
        bytes.push(0);
        Self(bytes)
    }

    /// The smallest key greater than every key that starts with `prefix`,
    /// or `None` when no such key exists (empty or all-0xFF prefix).
    #[must_use]
    pub fn prefix_end(prefix: &[u8]) -> Option<Self> {
        let last = prefix.iter().rposition(|&b| b != 0xFF)?;
        let mut bytes = prefix[..=last].to_vec();
        bytes[last] += 1;
        Some(Self(bytes))
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl Borrow<[u8]> for Key {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key(\"{}\")", self.0.escape_ascii())
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.escape_ascii())
    }
}

/// Right bound of a key range.
///
/// The derived order places every exclusive bound below `Unbounded`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RightBound {
    /// Keys strictly less than this key.
    Exclusive(Key),
    /// No upper limit.
    Unbounded,
}

impl RightBound {
    /// Whether `key` lies below this bound.
    #[must_use]
    pub fn admits(&self, key: &[u8]) -> bool {
        match self {
            Self::Exclusive(right) => key < right.as_bytes(),
            Self::Unbounded => true,
        }
    }
}

/// Traversal direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    /// Ascending key order.
    #[default]
    Forward,
    /// Descending key order.
    Backward,
}

/// A half-open key range `[left, right)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    left: Key,
    right: RightBound,
}

impl KeyRange {
    /// Create a range, rejecting `left > right`.
    pub fn new(left: Key, right: RightBound) -> Result<Self, KeyRangeError> {
        if let RightBound::Exclusive(r) = &right
            && left > *r
        {
            return Err(KeyRangeError::InvalidRange { left, right: r.clone() });
        }
        Ok(Self { left, right })
    }

    /// `[left, right)`.
    pub fn half_open(left: impl Into<Key>, right: impl Into<Key>) -> Result<Self, KeyRangeError> {
        Self::new(left.into(), RightBound::Exclusive(right.into()))
    }

    /// `[left, right]`.
    pub fn closed(left: impl Into<Key>, right: impl Into<Key>) -> Result<Self, KeyRangeError> {
        let left = left.into();
        let right = right.into();
        if left > right {
            return Err(KeyRangeError::InvalidRange { left, right });
        }
        Ok(Self {
            left,
            right: RightBound::Exclusive(right.successor()),
        })
    }

    /// Every key at or above `left`.
    #[must_use]
    pub fn at_least(left: impl Into<Key>) -> Self {
        Self {
            left: left.into(),
            right: RightBound::Unbounded,
        }
    }

    /// Every key.
    #[must_use]
    pub const fn universe() -> Self {
        Self {
            left: Key::min(),
            right: RightBound::Unbounded,
        }
    }

    /// A range containing nothing.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            left: Key::min(),
            right: RightBound::Exclusive(Key::min()),
        }
    }

    /// Every key starting with `prefix`.
    #[must_use]
    pub fn prefix(prefix: &[u8]) -> Self {
        Self {
            left: Key::from(prefix),
            right: Key::prefix_end(prefix).map_or(RightBound::Unbounded, RightBound::Exclusive),
        }
    }

    /// Build a range from bounds that may cross; crossed bounds yield an
    /// empty range at `left`.
    pub(crate) fn clamped(left: Key, right: RightBound) -> Self {
        match right {
            RightBound::Exclusive(r) if r < left => Self {
                right: RightBound::Exclusive(left.clone()),
                left,
            },
            right => Self { left, right },
        }
    }

    /// Inclusive left bound.
    #[must_use]
    pub const fn left(&self) -> &Key {
        &self.left
    }

    /// Right bound.
    #[must_use]
    pub const fn right(&self) -> &RightBound {
        &self.right
    }

    /// Whether the range contains no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(&self.right, RightBound::Exclusive(r) if *r <= self.left)
    }

    /// Whether `key` lies in the range.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.left.as_bytes() && self.right.admits(key)
    }

    /// Whether the two ranges share at least one key.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        !self.clip_to(other).is_empty()
    }

    /// The intersection of `self` and `bounds`.
    #[must_use]
    pub fn clip_to(&self, bounds: &Self) -> Self {
        let left = std::cmp::max(&self.left, &bounds.left).clone();
        let right = std::cmp::min(&self.right, &bounds.right).clone();
        Self::clamped(left, right)
    }

    /// What is left of `self` after every key of `visited` and everything
    /// before it (in `direction` order) has been consumed.
    #[must_use]
    pub fn remainder_after(&self, visited: &Self, direction: Direction) -> Self {
        match direction {
            Direction::Forward => match &visited.right {
                RightBound::Exclusive(end) => {
                    Self::clamped(std::cmp::max(&self.left, end).clone(), self.right.clone())
                }
                RightBound::Unbounded => Self::clamped(
                    self.left.clone(),
                    RightBound::Exclusive(self.left.clone()),
                ),
            },
            Direction::Backward => {
                let right = std::cmp::min(
                    self.right.clone(),
                    RightBound::Exclusive(visited.left.clone()),
                );
                Self::clamped(self.left.clone(), right)
            }
        }
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.right {
            RightBound::Exclusive(r) => write!(f, "[\"{}\", \"{}\")", self.left, r),
            RightBound::Unbounded => write!(f, "[\"{}\", +inf)", self.left),
        }
    }
}

/// Errors that can occur when constructing a key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRangeError {
    /// Left bound is greater than the right bound.
    InvalidRange { left: Key, right: Key },
}

impl std::fmt::Display for KeyRangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRange { left, right } => {
                write!(f, "invalid range: left \"{left}\" is greater than right \"{right}\"")
            }
        }
    }
}

impl std::error::Error for KeyRangeError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(left: &str, right: &str) -> KeyRange {
        KeyRange::half_open(left, right).expect("valid range")
    }

    #[test]
    fn test_compare_is_bytewise() {
        assert_eq!(compare(b"a", b"b"), Ordering::Less);
        assert_eq!(compare(b"ab", b"a"), Ordering::Greater);
        assert_eq!(compare(b"", b""), Ordering::Equal);
        assert_eq!(compare(&[0xFF], b"z"), Ordering::Greater);
    }

    #[test]
    fn test_invalid_range_rejected() {
        assert!(matches!(
            KeyRange::half_open("d", "b"),
            Err(KeyRangeError::InvalidRange { .. })
        ));
        assert!(KeyRange::closed("d", "b").is_err());
    }

    #[test]
    fn test_equal_bounds_are_empty() {
        let r = range("c", "c");
        assert!(r.is_empty());
        assert!(!r.contains(b"c"));
        assert!(KeyRange::empty().is_empty());
        assert!(!KeyRange::universe().is_empty());
    }

    #[test]
    fn test_contains_is_half_open() {
        let r = range("b", "d");
        assert!(!r.contains(b"a"));
        assert!(r.contains(b"b"));
        assert!(r.contains(b"c"));
        assert!(r.contains(b"cz"));
        assert!(!r.contains(b"d"));
    }

    #[test]
    fn test_closed_range_includes_right() {
        let r = KeyRange::closed("b", "d").expect("valid");
        assert!(r.contains(b"d"));
        assert!(!r.contains(b"d\x00"));
    }

    #[test]
    fn test_prefix_range() {
        let r = KeyRange::prefix(b"ab");
        assert!(r.contains(b"ab"));
        assert!(r.contains(b"ab\xFF\xFF"));
        assert!(!r.contains(b"ac"));
        assert!(!r.contains(b"aa"));

        let all = KeyRange::prefix(b"\xFF\xFF");
        assert_eq!(all.right(), &RightBound::Unbounded);
        assert_eq!(Key::prefix_end(b"a\xFF"), Some(Key::from("b")));
    }

    #[test]
    fn test_clip_and_intersects() {
        let r = range("b", "f");
        let bounds = range("d", "k");
        assert_eq!(r.clip_to(&bounds), range("d", "f"));
        assert!(r.intersects(&bounds));

        let disjoint = range("f", "k");
        assert!(!r.intersects(&disjoint));
        assert!(r.clip_to(&disjoint).is_empty());

        assert_eq!(KeyRange::universe().clip_to(&r), r);
    }

    #[test]
    fn test_remainder_after_forward() {
        let r = range("b", "z");
        let rest = r.remainder_after(&range("a", "m"), Direction::Forward);
        assert_eq!(rest, range("m", "z"));

        let done = r.remainder_after(&KeyRange::at_least("m"), Direction::Forward);
        assert!(done.is_empty());
    }

    #[test]
    fn test_remainder_after_backward() {
        let r = range("b", "z");
        let rest = r.remainder_after(&KeyRange::at_least("m"), Direction::Backward);
        assert_eq!(rest, range("b", "m"));

        let done = r.remainder_after(&range("", "m"), Direction::Backward);
        assert!(done.is_empty());
    }

    #[test]
    fn test_right_bound_order() {
        assert!(RightBound::Exclusive(Key::from("zzz")) < RightBound::Unbounded);
        assert!(RightBound::Exclusive(Key::from("a")) < RightBound::Exclusive(Key::from("b")));
    }

    #[test]
    fn test_display() {
        assert_eq!(range("a", "b").to_string(), "[\"a\", \"b\")");
        assert_eq!(KeyRange::at_least("a").to_string(), "[\"a\", +inf)");
    }
}
