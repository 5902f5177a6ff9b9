//! Transactions and block lock guards.
//!
//! A [`Transaction`] is the scope every block lock lives in. Locks are
//! acquired with [`Transaction::acquire`] and returned as [`BlockLock`]
//! guards that borrow the transaction, so a lock can never outlive the
//! transaction that granted it. Dropping a guard releases the lock.
//!
//! Closing a transaction (explicitly or by dropping it) makes every further
//! acquisition fail with `TransactionClosed`, including acquisitions that are
//! currently blocked waiting for a conflicting lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::storage::cache::{BufferCache, CacheError, LockMode};
use crate::storage::page::{BlockId, Page};

/// A scope for block locks.
pub struct Transaction {
    id: u64,
    cache: Arc<BufferCache>,
    open: AtomicBool,
    locks_acquired: AtomicU64,
    locks_held: AtomicUsize,
    peak_held: AtomicUsize,
}

impl Transaction {
    /// Begin a new transaction on `cache`.
    #[must_use]
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn begin(cache: &Arc<BufferCache>) -> Self {
        let id = cache.next_txn_id();
        tracing::debug!(txn = id, "transaction begin");
        Self {
            id,
            cache: Arc::clone(cache),
            open: AtomicBool::new(true),
            locks_acquired: AtomicU64::new(0),
            locks_held: AtomicUsize::new(0),
            peak_held: AtomicUsize::new(0),
        }
    }

    /// Transaction id, unique per cache.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The cache this transaction acquires locks from.
    #[must_use]
    pub const fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    /// Whether further locks can be acquired.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Close the transaction.
    ///
    /// Safe to call from another thread while a traversal is running in this
    /// transaction: its next acquisition (or a blocked one) fails with
    /// `TransactionClosed`. Locks already granted stay valid until their
    /// guards are dropped.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            tracing::debug!(
                txn = self.id,
                locks_acquired = self.locks_acquired(),
                "transaction closed"
            );
            self.cache.wake_waiters();
        }
    }

    /// Acquire a lock on `block_id`.
    ///
    /// Blocks while another transaction (or another guard in this one) holds
    /// a conflicting lock.
    pub fn acquire(&self, block_id: BlockId, mode: LockMode) -> Result<BlockLock<'_>, CacheError> {
        let page = self.cache.lock_block(self, block_id, mode)?;

        self.locks_acquired.fetch_add(1, Ordering::Relaxed);
        let held = self.locks_held.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_held.fetch_max(held, Ordering::AcqRel);

        Ok(BlockLock {
            txn: self,
            block_id,
            mode,
            page,
        })
    }

    /// Total locks granted over the transaction's lifetime.
    #[must_use]
    pub fn locks_acquired(&self) -> u64 {
        self.locks_acquired.load(Ordering::Relaxed)
    }

    /// Locks currently held.
    #[must_use]
    pub fn locks_held(&self) -> usize {
        self.locks_held.load(Ordering::Acquire)
    }

    /// Highest number of locks held at the same time.
    #[must_use]
    pub fn peak_locks_held(&self) -> usize {
        self.peak_held.load(Ordering::Acquire)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("locks_held", &self.locks_held())
            .finish_non_exhaustive()
    }
}

/// A granted lock on one block.
///
/// The block's page is readable for the lifetime of the guard. A write lock
/// may replace the page with [`BlockLock::write_page`].
pub struct BlockLock<'t> {
    txn: &'t Transaction,
    block_id: BlockId,
    mode: LockMode,
    page: Arc<Page>,
}

impl<'t> BlockLock<'t> {
    /// The locked block.
    #[must_use]
    pub const fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// The mode the lock was granted in.
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    /// The transaction that holds this lock.
    #[must_use]
    pub const fn transaction(&self) -> &'t Transaction {
        self.txn
    }

    /// The block's current contents.
    #[must_use]
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Replace the block's contents and write them through to the store.
    ///
    /// Requires a write lock.
    pub fn write_page(&mut self, page: Page) -> Result<(), CacheError> {
        if self.mode != LockMode::Write {
            return Err(CacheError::ReadOnlyLock(self.block_id));
        }
        self.page = self.txn.cache.write_through(self.block_id, page)?;
        Ok(())
    }
}

impl Drop for BlockLock<'_> {
    fn drop(&mut self) {
        self.txn.cache.release(self.block_id, self.mode);
        self.txn.locks_held.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for BlockLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockLock")
            .field("txn", &self.txn.id)
            .field("block_id", &self.block_id)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::{BlockStore, MemoryStore};

    fn cache() -> Arc<BufferCache> {
        let store = MemoryStore::new();
        store.allocate_block().expect("allocate");
        store.allocate_block().expect("allocate");
        BufferCache::new(Arc::new(store), 8)
    }

    #[test]
    fn test_lock_counters() {
        let cache = cache();
        let txn = Transaction::begin(&cache);

        let a = txn.acquire(0, LockMode::Read).expect("read 0");
        let b = txn.acquire(1, LockMode::Read).expect("read 1");
        drop(a);
        let c = txn.acquire(0, LockMode::Read).expect("read 0 again");

        assert_eq!(txn.locks_acquired(), 3);
        assert_eq!(txn.locks_held(), 2);
        assert_eq!(txn.peak_locks_held(), 2);

        drop(b);
        drop(c);
        assert_eq!(txn.locks_held(), 0);
    }

    #[test]
    fn test_transaction_ids_are_unique() {
        let cache = cache();
        let first = Transaction::begin(&cache);
        let second = Transaction::begin(&cache);
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn test_close_is_idempotent() {
        let cache = cache();
        let txn = Transaction::begin(&cache);
        assert!(txn.is_open());
        txn.close();
        txn.close();
        assert!(!txn.is_open());
    }

    #[test]
    fn test_guard_survives_close() {
        let cache = cache();
        let txn = Transaction::begin(&cache);
        let lock = txn.acquire(1, LockMode::Read).expect("read");

        txn.close();
        assert_eq!(lock.block_id(), 1);
        assert_eq!(lock.page().as_bytes().len(), crate::storage::PAGE_SIZE);
        drop(lock);
        assert_eq!(txn.locks_held(), 0);
    }

    #[test]
    fn test_closed_transaction_does_not_wait_on_writer() {
        let cache = cache();
        let txn = Transaction::begin(&cache);
        let other = Transaction::begin(&cache);
        let _write = txn.acquire(0, LockMode::Write).expect("write");

        // A closed transaction gives up instead of waiting forever.
        other.close();
        assert!(matches!(
            other.acquire(0, LockMode::Read),
            Err(CacheError::TransactionClosed)
        ));
    }
}
