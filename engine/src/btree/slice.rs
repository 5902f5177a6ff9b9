//! A handle to one tree in a store.

use crate::btree::keys::{Direction, Key, KeyRange, RightBound};
use crate::btree::traversal::{
    CollectPairs, TraversalCallback, TraversalError, TraversalOptions, TraversalOutcome,
    traverse_with,
};
use crate::storage::{BlockId, LockMode, Superblock, Transaction};

/// A tree identified by its superblock block.
///
/// The handle is a plain id; every operation runs inside the caller's
/// transaction and takes its own locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BTreeSlice {
    superblock_id: BlockId,
}

impl BTreeSlice {
    /// Refer to the tree whose superblock lives in `superblock_id`.
    #[must_use]
    pub const fn new(superblock_id: BlockId) -> Self {
        Self { superblock_id }
    }

    /// The tree's superblock block.
    #[must_use]
    pub const fn superblock_id(&self) -> BlockId {
        self.superblock_id
    }

    /// Read the superblock under a read lock.
    pub fn superblock(&self, txn: &Transaction) -> Result<Superblock, TraversalError> {
        let lock = txn.acquire(self.superblock_id, LockMode::Read)?;
        Superblock::from_page(lock.page()).map_err(|source| TraversalError::CorruptSuperblock {
            block_id: self.superblock_id,
            source,
        })
    }

    /// Deliver every pair in `range` to `callback` in `direction` order.
    pub fn traverse<C>(
        &self,
        txn: &Transaction,
        range: &KeyRange,
        direction: Direction,
        callback: &mut C,
    ) -> Result<TraversalOutcome, TraversalError>
    where
        C: TraversalCallback + ?Sized,
    {
        self.traverse_with(txn, range, direction, callback, &TraversalOptions::default())
    }

    /// [`BTreeSlice::traverse`] with explicit options.
    pub fn traverse_with<C>(
        &self,
        txn: &Transaction,
        range: &KeyRange,
        direction: Direction,
        callback: &mut C,
        options: &TraversalOptions,
    ) -> Result<TraversalOutcome, TraversalError>
    where
        C: TraversalCallback + ?Sized,
    {
        traverse_with(txn, self.superblock_id, range, direction, callback, options)
    }

    /// Look up one key.
    pub fn get(&self, txn: &Transaction, key: &[u8]) -> Result<Option<Vec<u8>>, TraversalError> {
        let key = Key::from(key);
        let exact = KeyRange::clamped(key.clone(), RightBound::Exclusive(key.successor()));
        let mut collect = CollectPairs::with_limit(1);
        self.traverse(txn, &exact, Direction::Forward, &mut collect)?;
        Ok(collect.into_pairs().pop().map(|(_, value)| value))
    }

    /// Number of pairs in `range`.
    pub fn count(&self, txn: &Transaction, range: &KeyRange) -> Result<u64, TraversalError> {
        let mut count = 0u64;
        let mut tally = |_key: &[u8], _value: &[u8]| {
            count += 1;
            true
        };
        self.traverse(txn, range, Direction::Forward, &mut tally)?;
        Ok(count)
    }
}
