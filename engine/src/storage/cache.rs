//! Buffer cache with per-block read/write locks.
//!
//! The cache owns the set of resident pages and a lock table keyed by block
//! id. Lock acquisition goes through a [`Transaction`]; the returned
//! [`BlockLock`](crate::storage::BlockLock) releases on drop.
//!
//! # Design
//!
//! - One mutex guards the lock table and the resident map; it is never held
//!   across I/O. A cache miss is fetched after the block lock is granted,
//!   with the mutex released, so a slow read only delays traversals that
//!   need that same block.
//! - Waiters park on a single condvar and re-check on every release.
//! - Resident pages are leased from a fixed [`BufferPool`]. When the pool
//!   runs dry an unlocked, unreferenced resident page is evicted.
//!
//! # Invariants
//!
//! - A block has either one writer or any number of readers, never both.
//! - A lock-table entry exists only while at least one lock is granted.
//! - A resident page referenced by a live lock is never evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::storage::buffer_pool::BufferPool;
use crate::storage::page::{BlockId, Page};
use crate::storage::store::{BlockStore, StoreError};
use crate::storage::transaction::Transaction;

/// Access mode for a block lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared access; coexists with other readers.
    Read,
    /// Exclusive access; excludes all other locks on the block.
    Write,
}

#[derive(Debug, Default)]
struct BlockLockState {
    readers: usize,
    writer: bool,
}

impl BlockLockState {
    const fn admits(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => !self.writer,
            LockMode::Write => !self.writer && self.readers == 0,
        }
    }

    fn grant(&mut self, mode: LockMode) {
        match mode {
            LockMode::Read => self.readers += 1,
            LockMode::Write => self.writer = true,
        }
    }

    fn release(&mut self, mode: LockMode) {
        match mode {
            LockMode::Read => {
                debug_assert!(self.readers > 0, "releasing a read lock that was not held");
                self.readers = self.readers.saturating_sub(1);
            }
            LockMode::Write => {
                debug_assert!(self.writer, "releasing a write lock that was not held");
                self.writer = false;
            }
        }
    }

    const fn is_free(&self) -> bool {
        !self.writer && self.readers == 0
    }
}

#[derive(Default)]
struct CacheState {
    locks: HashMap<BlockId, BlockLockState>,
    resident: HashMap<BlockId, Arc<Page>>,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    lock_waits: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatsSnapshot {
    /// Lock grants that found the page resident.
    pub hits: u64,
    /// Lock grants that had to fetch the page from the store.
    pub misses: u64,
    /// Resident pages dropped to make room.
    pub evictions: u64,
    /// Acquisitions that had to wait for a conflicting lock.
    pub lock_waits: u64,
}

/// The buffer cache: resident pages plus the block lock table.
pub struct BufferCache {
    store: Arc<dyn BlockStore>,
    pool: Arc<BufferPool>,
    state: Mutex<CacheState>,
    released: Condvar,
    stats: CacheStats,
    next_txn_id: AtomicU64,
}

impl BufferCache {
    /// Create a cache over `store` with a private pool of `capacity` pages.
    ///
    /// # Panics
    /// Panics if capacity is 0.
    #[must_use]
    pub fn new(store: Arc<dyn BlockStore>, capacity: usize) -> Arc<Self> {
        Self::with_pool(store, BufferPool::new(capacity))
    }

    /// Create a cache over `store` that leases pages from a shared pool.
    #[must_use]
    pub fn with_pool(store: Arc<dyn BlockStore>, pool: Arc<BufferPool>) -> Arc<Self> {
        Arc::new(Self {
            store,
            pool,
            state: Mutex::new(CacheState::default()),
            released: Condvar::new(),
            stats: CacheStats::default(),
            next_txn_id: AtomicU64::new(1),
        })
    }

    /// The underlying block store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// The pool resident pages are leased from.
    #[must_use]
    pub const fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Number of pages currently resident.
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.lock_state().resident.len()
    }

    /// Snapshot of the cache counters.
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            lock_waits: self.stats.lock_waits.load(Ordering::Relaxed),
        }
    }

    /// Append a new zeroed block to the store.
    pub fn allocate_block(&self) -> Result<BlockId, CacheError> {
        Ok(self.store.allocate_block()?)
    }

    /// Lease a zeroed page for building new block contents.
    pub fn lease_page_zeroed(&self) -> Result<Page, CacheError> {
        let mut page = self.lease_page()?;
        page.as_bytes_mut().fill(0);
        Ok(page)
    }

    pub(crate) fn next_txn_id(&self) -> u64 {
        self.next_txn_id.fetch_add(1, Ordering::Relaxed)
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Grant `mode` on `block_id` to `txn`, blocking while a conflicting lock
    /// is held, and return the block's resident page.
    ///
    /// On error no lock is held.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub(crate) fn lock_block(
        &self,
        txn: &Transaction,
        block_id: BlockId,
        mode: LockMode,
    ) -> Result<Arc<Page>, CacheError> {
        if !txn.is_open() {
            return Err(CacheError::TransactionClosed);
        }
        if block_id >= self.store.block_count() {
            return Err(CacheError::BlockNotFound(block_id));
        }

        {
            let mut state = self.lock_state();
            let mut waited = false;
            loop {
                if !txn.is_open() {
                    return Err(CacheError::TransactionClosed);
                }
                let entry = state.locks.entry(block_id).or_default();
                if entry.admits(mode) {
                    entry.grant(mode);
                    break;
                }
                if !waited {
                    waited = true;
                    self.stats.lock_waits.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(txn = txn.id(), block_id, ?mode, "waiting for block lock");
                }
                state = self.released.wait(state).expect("lock poisoned");
            }

            if let Some(page) = state.resident.get(&block_id) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(page));
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        self.fetch(block_id).inspect_err(|_| self.release(block_id, mode))
    }

    /// Read a block from the store into a pool page and make it resident.
    ///
    /// The caller holds a lock on the block, so only concurrent readers can
    /// race here; the first insert wins and all of them share it.
    fn fetch(&self, block_id: BlockId) -> Result<Arc<Page>, CacheError> {
        let mut page = self.lease_page()?;
        self.store.read_block(block_id, page.as_bytes_mut())?;
        tracing::trace!(block_id, "fetched block from store");

        let page = Arc::new(page);
        let mut state = self.lock_state();
        Ok(Arc::clone(state.resident.entry(block_id).or_insert(page)))
    }

    /// Replace a block's contents. The caller must hold a write lock on it.
    pub(crate) fn write_through(
        &self,
        block_id: BlockId,
        page: Page,
    ) -> Result<Arc<Page>, CacheError> {
        self.store.write_block(block_id, page.as_bytes())?;
        let page = Arc::new(page);
        self.lock_state()
            .resident
            .insert(block_id, Arc::clone(&page));
        Ok(page)
    }

    /// Release a lock granted by `lock_block` and wake waiters.
    pub(crate) fn release(&self, block_id: BlockId, mode: LockMode) {
        {
            let mut state = self.lock_state();
            if let Some(entry) = state.locks.get_mut(&block_id) {
                entry.release(mode);
                if entry.is_free() {
                    state.locks.remove(&block_id);
                }
            }
        }
        self.released.notify_all();
    }

    /// Wake every waiter so it can re-check its transaction.
    pub(crate) fn wake_waiters(&self) {
        let _state = self.lock_state();
        self.released.notify_all();
    }

    fn lease_page(&self) -> Result<Page, CacheError> {
        loop {
            if let Some(page) = self.pool.lease_page() {
                return Ok(page);
            }
            if !self.evict_one() {
                tracing::warn!(
                    capacity = self.pool.capacity(),
                    "buffer pool exhausted with every resident page in use"
                );
                return Err(CacheError::PoolExhausted);
            }
        }
    }

    /// Drop one resident page that no lock references. Returns whether a
    /// page was evicted.
    fn evict_one(&self) -> bool {
        let evicted = {
            let mut state = self.lock_state();
            let victim = state
                .resident
                .iter()
                .find(|(id, page)| Arc::strong_count(page) == 1 && !state.locks.contains_key(id))
                .map(|(id, _)| *id);
            victim.and_then(|id| state.resident.remove(&id).map(|page| (id, page)))
        };

        match evicted {
            Some((block_id, page)) => {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(block_id, "evicted resident page");
                // Returns the buffer to the pool outside the state mutex.
                drop(page);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("pool", &self.pool)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Errors that can occur when acquiring or using block locks.
#[derive(Debug)]
pub enum CacheError {
    /// The block does not exist in the store.
    BlockNotFound(BlockId),
    /// The transaction was closed before or while acquiring.
    TransactionClosed,
    /// No page buffer could be leased or freed.
    PoolExhausted,
    /// A write was attempted through a read lock.
    ReadOnlyLock(BlockId),
    /// Block store failure.
    Store(StoreError),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlockNotFound(id) => write!(f, "block {id} not found"),
            Self::TransactionClosed => write!(f, "transaction is closed"),
            Self::PoolExhausted => write!(f, "buffer pool exhausted"),
            Self::ReadOnlyLock(id) => write!(f, "block {id} is only read-locked"),
            Self::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for CacheError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::OutOfBounds { block_id, .. } => Self::BlockNotFound(block_id),
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;
    use crate::storage::store::MemoryStore;

    fn cache_with_blocks(blocks: u64, capacity: usize) -> Arc<BufferCache> {
        let store = MemoryStore::new();
        for _ in 0..blocks {
            store.allocate_block().expect("allocate");
        }
        BufferCache::new(Arc::new(store), capacity)
    }

    #[test]
    fn test_read_locks_share_a_block() {
        let cache = cache_with_blocks(1, 4);
        let txn = Transaction::begin(&cache);

        let first = txn.acquire(0, LockMode::Read).expect("first read");
        let second = txn.acquire(0, LockMode::Read).expect("second read");
        assert_eq!(txn.locks_held(), 2);

        drop(first);
        drop(second);
        assert_eq!(txn.locks_held(), 0);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_missing_block_is_not_found() {
        let cache = cache_with_blocks(1, 4);
        let txn = Transaction::begin(&cache);

        assert!(matches!(
            txn.acquire(5, LockMode::Read),
            Err(CacheError::BlockNotFound(5))
        ));
        assert_eq!(txn.locks_held(), 0);
    }

    #[test]
    fn test_closed_transaction_cannot_acquire() {
        let cache = cache_with_blocks(1, 4);
        let txn = Transaction::begin(&cache);
        txn.close();

        assert!(matches!(
            txn.acquire(0, LockMode::Read),
            Err(CacheError::TransactionClosed)
        ));
    }

    #[test]
    fn test_writer_blocks_reader_until_release() {
        let cache = cache_with_blocks(1, 4);
        let writer_txn = Transaction::begin(&cache);
        let reader_txn = Transaction::begin(&cache);
        let reader_done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            let write_lock = writer_txn.acquire(0, LockMode::Write).expect("write");

            scope.spawn(|| {
                let _read = reader_txn.acquire(0, LockMode::Read).expect("read");
                reader_done.store(true, Ordering::SeqCst);
            });

            std::thread::sleep(Duration::from_millis(50));
            assert!(!reader_done.load(Ordering::SeqCst));
            drop(write_lock);
        });

        assert!(reader_done.load(Ordering::SeqCst));
        assert!(cache.stats().lock_waits >= 1);
    }

    #[test]
    fn test_closing_transaction_aborts_blocked_acquire() {
        let cache = cache_with_blocks(1, 4);
        let writer_txn = Transaction::begin(&cache);
        let reader_txn = Transaction::begin(&cache);

        let _write_lock = writer_txn.acquire(0, LockMode::Write).expect("write");
        std::thread::scope(|scope| {
            let blocked = scope.spawn(|| reader_txn.acquire(0, LockMode::Read).map(|_| ()));

            std::thread::sleep(Duration::from_millis(50));
            reader_txn.close();

            let result = blocked.join().expect("thread");
            assert!(matches!(result, Err(CacheError::TransactionClosed)));
        });
        assert_eq!(reader_txn.locks_held(), 0);
    }

    #[test]
    fn test_write_lock_rewrites_block() {
        let cache = cache_with_blocks(1, 4);
        let txn = Transaction::begin(&cache);

        {
            let mut lock = txn.acquire(0, LockMode::Write).expect("write");
            let mut page = cache.lease_page_zeroed().expect("lease");
            page.write_bytes(0, b"abc");
            lock.write_page(page).expect("write page");
            assert_eq!(lock.page().read_bytes(0, 3), b"abc");
        }

        let mut buf = vec![0u8; crate::storage::PAGE_SIZE];
        cache.store().read_block(0, &mut buf).expect("read");
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn test_read_lock_cannot_write() {
        let cache = cache_with_blocks(1, 4);
        let txn = Transaction::begin(&cache);
        let mut lock = txn.acquire(0, LockMode::Read).expect("read");
        let page = cache.lease_page_zeroed().expect("lease");

        assert!(matches!(
            lock.write_page(page),
            Err(CacheError::ReadOnlyLock(0))
        ));
    }

    #[test]
    fn test_eviction_frees_unlocked_pages() {
        let cache = cache_with_blocks(4, 2);
        let txn = Transaction::begin(&cache);

        for block_id in 0..4 {
            let _lock = txn.acquire(block_id, LockMode::Read).expect("read");
        }

        assert!(cache.resident_count() <= 2);
        assert!(cache.stats().evictions >= 2);
    }

    #[test]
    fn test_pool_exhausted_when_all_pages_locked() {
        let cache = cache_with_blocks(3, 2);
        let txn = Transaction::begin(&cache);

        let _a = txn.acquire(0, LockMode::Read).expect("read 0");
        let _b = txn.acquire(1, LockMode::Read).expect("read 1");
        assert!(matches!(
            txn.acquire(2, LockMode::Read),
            Err(CacheError::PoolExhausted)
        ));
        assert_eq!(txn.locks_held(), 2);
    }
}
