//! Buffer pool for pre-allocated page buffers.
//!
//! The buffer cache never allocates page memory on the read path: every
//! resident block occupies one buffer leased from this pool, and the buffer
//! comes back automatically when the last reference to the page is dropped.
//!
//! # Design
//!
//! - Pre-allocates all buffers at construction time
//! - Uses a free list (Vec) for O(1) lease/return
//! - Returns buffers automatically via RAII (Drop trait on Page)
//! - Thread-safe: uses Mutex for internal synchronization
//!
//! # Invariants
//!
//! - Pool capacity is fixed after construction
//! - Free list size + leased count == capacity

use std::sync::{Arc, Mutex};

use crate::storage::page::{PAGE_SIZE, Page};

/// Default buffer pool capacity in pages (4,096 pages = 32MB).
pub const DEFAULT_POOL_CAPACITY: usize = 4096;

/// A buffer pool that pre-allocates page buffers.
///
/// # Pre-conditions
/// - `capacity` must be > 0 when creating
///
/// # Post-conditions
/// - The free list starts with `capacity` zeroed buffers
///
/// # Invariants
/// - `free_list.len() + leased_count == capacity`
pub struct BufferPool {
    /// Free buffers available for leasing.
    /// Invariant: all buffers are `PAGE_SIZE` bytes.
    free_list: Mutex<Vec<Box<[u8]>>>,
    /// Total capacity (for assertions).
    capacity: usize,
}

impl BufferPool {
    /// Create a new buffer pool with the given capacity.
    ///
    /// # Pre-conditions
    /// - `capacity` > 0
    ///
    /// # Post-conditions
    /// - Every buffer is `PAGE_SIZE` zeroed bytes
    ///
    /// # Panics
    /// Panics if capacity is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "Buffer pool capacity must be positive");

        let free_list = (0..capacity)
            .map(|_| vec![0u8; PAGE_SIZE].into_boxed_slice())
            .collect();

        Arc::new(Self {
            free_list: Mutex::new(free_list),
            capacity,
        })
    }

    /// Lease a buffer from the pool.
    ///
    /// Returns `None` if the pool is exhausted; the cache then evicts an
    /// unreferenced resident page and retries.
    ///
    /// # Post-conditions
    /// - If Some, `available()` decreased by 1
    /// - Buffer contents are undefined (may contain stale data)
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn lease(&self) -> Option<Box<[u8]>> {
        self.free_list.lock().expect("lock poisoned").pop()
    }

    /// Lease a zeroed buffer from the pool.
    ///
    /// # Post-conditions
    /// - If Some, `available()` decreased by 1 and the buffer is all zeros
    pub fn lease_zeroed(&self) -> Option<Box<[u8]>> {
        let mut buffer = self.lease()?;
        buffer.fill(0);
        Some(buffer)
    }

    /// Lease a page from the pool.
    ///
    /// Page contents are undefined (may contain stale data).
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn lease_page(self: &Arc<Self>) -> Option<Page> {
        let buffer = self.lease()?;
        Some(Page::from_pool(buffer, Arc::clone(self)))
    }

    /// Lease a zeroed page from the pool.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn lease_page_zeroed(self: &Arc<Self>) -> Option<Page> {
        let buffer = self.lease_zeroed()?;
        Some(Page::from_pool(buffer, Arc::clone(self)))
    }

    /// Return a buffer to the pool.
    ///
    /// # Pre-conditions
    /// - The buffer was leased from this pool (dropping a `Page` guarantees it)
    ///
    /// # Post-conditions
    /// - `available()` increased by 1
    ///
    /// # Panics
    /// Panics if returning would exceed capacity or the buffer has the wrong
    /// size (both indicate a bug).
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn return_buffer(&self, buffer: Box<[u8]>) {
        assert_eq!(buffer.len(), PAGE_SIZE, "Buffer pool received a foreign buffer");
        let mut free_list = self.free_list.lock().expect("lock poisoned");
        assert!(
            free_list.len() < self.capacity,
            "Buffer pool overflow: returning buffer to full pool"
        );
        free_list.push(buffer);
    }

    /// Get the number of available buffers.
    #[must_use]
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn available(&self) -> usize {
        self.free_list.lock().expect("lock poisoned").len()
    }

    /// Get the total capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}
