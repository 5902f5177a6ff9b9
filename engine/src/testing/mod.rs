//! Helpers shared by unit tests.

use std::sync::Arc;

use crate::btree::{LoadOptions, bulk_load};
use crate::storage::{BlockId, BlockStore, BufferCache, MemoryStore, Transaction};

/// Cache size used by test trees.
pub const TEST_CACHE_PAGES: usize = 64;

/// The `i`th key of an ordered test key sequence.
pub fn key_of(i: usize) -> String {
    format!("key{i:05}")
}

/// Entries for `keys`, each with the value `value-<key>`.
pub fn pairs(keys: &[&str]) -> Vec<(Vec<u8>, Vec<u8>)> {
    keys.iter()
        .map(|key| (key.as_bytes().to_vec(), format!("value-{key}").into_bytes()))
        .collect()
}

/// Build a tree over `keys` in a fresh in-memory store.
///
/// Returns the cache and the tree's superblock block.
pub fn sample_tree(keys: &[&str], options: &LoadOptions) -> (Arc<BufferCache>, BlockId) {
    let store: Arc<dyn BlockStore> = Arc::new(MemoryStore::new());
    let cache = BufferCache::new(store, TEST_CACHE_PAGES);
    let slice = {
        let txn = Transaction::begin(&cache);
        bulk_load(&txn, &pairs(keys), options).expect("load test tree")
    };
    (cache, slice.superblock_id())
}
