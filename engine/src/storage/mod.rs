//! Paged block storage with a locking buffer cache.
//!
//! # Layout
//!
//! A store is a sequence of 8KB blocks:
//!
//! - Block 0: superblock of the first tree (root pointer and metadata)
//! - Remaining blocks: B-tree nodes, or further superblocks
//!
//! # Usage
//!
//! ```ignore
//! use engine::storage::{BufferCache, LockMode, MemoryStore, Transaction};
//!
//! let cache = BufferCache::new(Arc::new(MemoryStore::new()), 64);
//! let txn = Transaction::begin(&cache);
//!
//! // Read-lock a block; the lock is released when the guard drops.
//! let lock = txn.acquire(block_id, LockMode::Read)?;
//! let bytes = lock.page().as_bytes();
//! ```

mod buffer_pool;
mod cache;
mod page;
mod store;
mod superblock;
mod transaction;

pub use buffer_pool::{BufferPool, DEFAULT_POOL_CAPACITY};
pub use cache::{BufferCache, CacheError, CacheStatsSnapshot, LockMode};
pub use page::{
    BlockId, NULL_BLOCK_ID, PAGE_SIZE, PAGE_SIZE_U64, Page, PageError, PageHeader, PageType,
};
pub use store::{BlockStore, FileStore, MemoryStore, StoreError};
pub use superblock::{FORMAT_VERSION, MAGIC, RootProvider, Superblock, SuperblockError};
pub use transaction::{BlockLock, Transaction};
