//! Simulated block store for deterministic testing.
//!
//! Blocks live in a [`MemoryStore`]; every read and write first consults a
//! seeded RNG to decide whether to inject a fault:
//! - Block-level read/write errors
//! - Bit flips in the bytes returned by a read
//! - Sync failures

// Simulation code legitimately needs cloning for test data
#![allow(clippy::disallowed_methods)]

use std::sync::{Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::{BlockId, BlockStore, MemoryStore, PAGE_SIZE, StoreError};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
    /// Probability that a successful read returns flipped bits (0.0 - 1.0).
    pub corruption_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Create a fault config with low fault rates (for stress testing).
    #[must_use]
    pub const fn low_faults() -> Self {
        Self {
            read_error_rate: 0.001,
            write_error_rate: 0.001,
            sync_error_rate: 0.001,
            corruption_rate: 0.001,
        }
    }

    /// Create a fault config with high fault rates (for extreme testing).
    #[must_use]
    pub const fn high_faults() -> Self {
        Self {
            read_error_rate: 0.05,
            write_error_rate: 0.05,
            sync_error_rate: 0.05,
            corruption_rate: 0.05,
        }
    }

    /// Whether any fault can be injected.
    #[must_use]
    pub fn injects_faults(&self) -> bool {
        self.read_error_rate > 0.0
            || self.write_error_rate > 0.0
            || self.sync_error_rate > 0.0
            || self.corruption_rate > 0.0
    }
}

/// Statistics about simulated store operations.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulatedStoreStats {
    pub reads: u64,
    pub writes: u64,
    pub syncs: u64,
    pub injected_read_errors: u64,
    pub injected_write_errors: u64,
    pub injected_sync_errors: u64,
    /// Reads that returned flipped bits.
    pub corrupted_reads: u64,
}

struct FaultState {
    config: FaultConfig,
    rng: StdRng,
    stats: SimulatedStoreStats,
}

impl FaultState {
    fn should_inject(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }

    /// Flip 1-8 random bits.
    fn corrupt(&mut self, buf: &mut [u8]) {
        let flips = self.rng.random_range(1..=8);
        for _ in 0..flips {
            let offset = self.rng.random_range(0..PAGE_SIZE);
            let bit = self.rng.random_range(0..8u8);
            buf[offset] ^= 1 << bit;
        }
    }
}

/// In-memory block store with seeded fault injection.
///
/// The fault decisions for a given sequence of calls depend only on the
/// seed. Calls from several threads are serialized on one RNG, so
/// multi-threaded runs are reproducible only up to thread interleaving.
pub struct SimulatedStore {
    blocks: MemoryStore,
    faults: Mutex<FaultState>,
}

impl SimulatedStore {
    /// Create a store that never injects faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, FaultConfig::default())
    }

    #[must_use]
    pub fn with_config(seed: u64, config: FaultConfig) -> Self {
        Self {
            blocks: MemoryStore::new(),
            faults: Mutex::new(FaultState {
                config,
                rng: StdRng::seed_from_u64(seed),
                stats: SimulatedStoreStats::default(),
            }),
        }
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn faults(&self) -> MutexGuard<'_, FaultState> {
        self.faults.lock().expect("lock poisoned")
    }

    /// Replace the fault configuration.
    pub fn set_fault_config(&self, config: FaultConfig) {
        self.faults().config = config;
    }

    #[must_use]
    pub fn stats(&self) -> SimulatedStoreStats {
        self.faults().stats.clone()
    }
}

impl std::fmt::Debug for SimulatedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedStore")
            .field("block_count", &self.blocks.block_count())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl BlockStore for SimulatedStore {
    fn read_block(&self, block_id: BlockId, buf: &mut [u8]) -> Result<(), StoreError> {
        let mut faults = self.faults();
        faults.stats.reads += 1;

        let rate = faults.config.read_error_rate;
        if faults.should_inject(rate) {
            faults.stats.injected_read_errors += 1;
            return Err(StoreError::InjectedFault(format!(
                "simulated read error on block {block_id}"
            )));
        }

        self.blocks.read_block(block_id, buf)?;

        let rate = faults.config.corruption_rate;
        if faults.should_inject(rate) {
            faults.stats.corrupted_reads += 1;
            faults.corrupt(buf);
        }
        Ok(())
    }

    fn write_block(&self, block_id: BlockId, buf: &[u8]) -> Result<(), StoreError> {
        let mut faults = self.faults();
        faults.stats.writes += 1;

        let rate = faults.config.write_error_rate;
        if faults.should_inject(rate) {
            faults.stats.injected_write_errors += 1;
            return Err(StoreError::InjectedFault(format!(
                "simulated write error on block {block_id}"
            )));
        }

        self.blocks.write_block(block_id, buf)
    }

    fn allocate_block(&self) -> Result<BlockId, StoreError> {
        self.blocks.allocate_block()
    }

    fn block_count(&self) -> u64 {
        self.blocks.block_count()
    }

    fn sync(&self) -> Result<(), StoreError> {
        let mut faults = self.faults();
        faults.stats.syncs += 1;

        let rate = faults.config.sync_error_rate;
        if faults.should_inject(rate) {
            faults.stats.injected_sync_errors += 1;
            return Err(StoreError::InjectedFault("simulated sync error".to_string()));
        }
        Ok(())
    }
}
