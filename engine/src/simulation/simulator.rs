//! Main simulator harness for deterministic simulation testing.
//!
//! A run builds a random tree in a [`SimulatedStore`], then issues random
//! traversals (random range, direction, batch size and stop point) and checks
//! each one against the sorted key model. Optional writer threads keep
//! rewriting leaves under write locks while the traversals run, and the
//! store can inject read, write and corruption faults.

// Simulation code legitimately needs cloning for test data
#![allow(clippy::disallowed_methods)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::invariants::{
    InvariantChecker, InvariantViolation, TraversalRecord, value_for, value_matches,
};
use super::storage::{FaultConfig, SimulatedStore, SimulatedStoreStats};
use crate::btree::{
    BTreeSlice, CollectPairs, Direction, KeyRange, LeafEntry, LeafNode, LoadOptions, Node,
    TraversalError, TraversalOptions, TraversalOutcome, bulk_load,
};
use crate::storage::{
    BlockId, BlockStore, BufferCache, CacheStatsSnapshot, LockMode, NULL_BLOCK_ID, RootProvider,
    Transaction,
};

/// Configuration for the simulator.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility.
    pub seed: u64,
    /// Fault injection applied once the tree is loaded.
    pub fault_config: FaultConfig,
    /// Distinct keys in the generated tree.
    pub key_count: usize,
    /// Shape of the generated tree.
    pub load_options: LoadOptions,
    /// Buffer cache capacity in pages.
    pub cache_pages: usize,
    /// Threads issuing traversals.
    pub reader_threads: usize,
    /// Threads rewriting leaves while readers run.
    pub writer_threads: usize,
}

impl SimulatorConfig {
    /// Create a new simulator config with the given seed.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            seed,
            fault_config: FaultConfig {
                read_error_rate: 0.0,
                write_error_rate: 0.0,
                sync_error_rate: 0.0,
                corruption_rate: 0.0,
            },
            key_count: 300,
            load_options: LoadOptions {
                max_leaf_entries: 8,
                max_fanout: 4,
            },
            cache_pages: 32,
            reader_threads: 1,
            writer_threads: 0,
        }
    }

    /// Set the fault configuration.
    #[must_use]
    pub const fn with_fault_config(mut self, config: FaultConfig) -> Self {
        self.fault_config = config;
        self
    }

    #[must_use]
    pub const fn with_key_count(mut self, key_count: usize) -> Self {
        self.key_count = key_count;
        self
    }

    #[must_use]
    pub const fn with_load_options(mut self, options: LoadOptions) -> Self {
        self.load_options = options;
        self
    }

    #[must_use]
    pub const fn with_cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    /// Run traversals on `readers` threads alongside `writers` leaf
    /// rewriting threads. Anything but one reader and no writers gives up
    /// exact reproducibility.
    #[must_use]
    pub const fn with_threads(mut self, readers: usize, writers: usize) -> Self {
        self.reader_threads = readers;
        self.writer_threads = writers;
        self
    }
}

/// Results from a simulation run.
#[derive(Debug)]
pub struct SimulationResult {
    /// The seed used for this simulation.
    pub seed: u64,
    pub traversals: u64,
    pub completed: u64,
    pub stopped: u64,
    /// Traversals that ended in an error (expected only under faults).
    pub failed: u64,
    pub pairs_delivered: u64,
    /// Leaves rewritten by writer threads.
    pub leaf_rewrites: u64,
    /// Invariant violations detected.
    pub invariant_violations: Vec<InvariantViolation>,
    pub store_stats: SimulatedStoreStats,
    pub cache_stats: CacheStatsSnapshot,
    /// Whether setup and every thread finished.
    pub completed_successfully: bool,
    /// Error message if simulation failed.
    pub error: Option<String>,
}

impl SimulationResult {
    fn setup_failed(seed: u64, error: String) -> Self {
        Self {
            seed,
            traversals: 0,
            completed: 0,
            stopped: 0,
            failed: 0,
            pairs_delivered: 0,
            leaf_rewrites: 0,
            invariant_violations: Vec::new(),
            store_stats: SimulatedStoreStats::default(),
            cache_stats: CacheStatsSnapshot::default(),
            completed_successfully: false,
            error: Some(error),
        }
    }

    /// Check if the simulation passed (no invariant violations).
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.completed_successfully && self.invariant_violations.is_empty()
    }
}

/// One random traversal.
#[derive(Debug, Clone)]
struct TraversalPlan {
    range: KeyRange,
    direction: Direction,
    stop_after: Option<usize>,
    batch_size: usize,
}

/// Per-reader tallies.
#[derive(Debug, Default)]
struct ReaderTally {
    traversals: u64,
    completed: u64,
    stopped: u64,
    failed: u64,
    pairs_delivered: u64,
}

/// The main simulator harness.
pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
    store: Arc<SimulatedStore>,
    cache: Arc<BufferCache>,
    /// Sorted keys the tree was built from.
    model: Vec<Vec<u8>>,
}

impl Simulator {
    /// Create a new simulator with the given configuration.
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        let store = Arc::new(SimulatedStore::new(config.seed));
        let dyn_store = Arc::clone(&store) as Arc<dyn BlockStore>;
        let cache = BufferCache::new(dyn_store, config.cache_pages);
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            store,
            cache,
            model: Vec::new(),
        }
    }

    /// The key space probes are drawn from; about a quarter of it is in the
    /// tree.
    fn key_space(&self) -> u64 {
        self.config.key_count as u64 * 4 + 1
    }

    fn key_at(n: u64) -> Vec<u8> {
        format!("k{n:08}").into_bytes()
    }

    /// Build the model and load it into a fresh tree, with faults off.
    fn build_tree(&mut self) -> Result<(BTreeSlice, Vec<BlockId>), String> {
        let space = self.key_space();
        let mut keys = BTreeSet::new();
        while keys.len() < self.config.key_count {
            keys.insert(Self::key_at(self.rng.random_range(0..space)));
        }
        self.model = keys.into_iter().collect();

        let entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .model
            .iter()
            .map(|key| (key.clone(), value_for(key)))
            .collect();

        let txn = Transaction::begin(&self.cache);
        let slice = bulk_load(&txn, &entries, &self.config.load_options)
            .map_err(|e| format!("failed to load tree: {e}"))?;
        let leaves = collect_leaves(&txn, slice).map_err(|e| format!("failed to walk tree: {e}"))?;
        drop(txn);

        self.store.set_fault_config(self.config.fault_config.clone());
        Ok((slice, leaves))
    }

    fn random_probe(rng: &mut StdRng, space: u64) -> Vec<u8> {
        match rng.random_range(0..20) {
            0 => Vec::new(),
            1 => b"k0".to_vec(),
            2 => b"l".to_vec(),
            _ => Self::key_at(rng.random_range(0..space)),
        }
    }

    fn random_plan(rng: &mut StdRng, space: u64) -> TraversalPlan {
        let a = Self::random_probe(rng, space);
        let b = Self::random_probe(rng, space);
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let range = match rng.random_range(0..6) {
            0 => KeyRange::universe(),
            1 => KeyRange::at_least(low),
            2 => KeyRange::prefix(&high[..high.len().min(6)]),
            3 => KeyRange::closed(low.clone(), high).unwrap_or_else(|_| KeyRange::at_least(low)),
            _ => KeyRange::half_open(low.clone(), high).unwrap_or_else(|_| KeyRange::at_least(low)),
        };
        let direction = if rng.random_bool(0.5) {
            Direction::Forward
        } else {
            Direction::Backward
        };
        let stop_after = rng.random_bool(0.3).then(|| rng.random_range(1..=40));
        let batch_size = rng.random_range(1..=16);
        TraversalPlan {
            range,
            direction,
            stop_after,
            batch_size,
        }
    }

    fn expected_keys(&self, plan: &TraversalPlan) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = self
            .model
            .iter()
            .filter(|key| plan.range.contains(key))
            .cloned()
            .collect();
        if plan.direction == Direction::Backward {
            keys.reverse();
        }
        keys
    }

    /// Run the simulation for `traversal_count` traversals, split across the
    /// configured reader threads.
    pub fn run(&mut self, traversal_count: usize) -> SimulationResult {
        let seed = self.config.seed;
        let (slice, leaves) = match self.build_tree() {
            Ok(built) => built,
            Err(error) => return SimulationResult::setup_failed(seed, error),
        };
        tracing::debug!(seed, keys = self.model.len(), leaves = leaves.len(), "simulated tree built");

        let checker = if self.config.fault_config.injects_faults() {
            InvariantChecker::allowing_errors()
        } else {
            InvariantChecker::new()
        };

        let readers = self.config.reader_threads.max(1);
        let space = self.key_space();
        let mut plans: Vec<Vec<TraversalPlan>> = vec![Vec::new(); readers];
        for i in 0..traversal_count {
            plans[i % readers].push(Self::random_plan(&mut self.rng, space));
        }

        let writers_done = AtomicBool::new(false);
        let leaf_rewrites = AtomicU64::new(0);
        let this = &*self;

        let (outcomes, threads_ok) = std::thread::scope(|scope| {
            let writer_handles: Vec<_> = (0..this.config.writer_threads)
                .map(|w| {
                    let writer_seed = seed.wrapping_add(1 + w as u64);
                    let leaves = &leaves;
                    let done = &writers_done;
                    let rewrites = &leaf_rewrites;
                    scope.spawn(move || this.rewrite_leaves(writer_seed, leaves, done, rewrites))
                })
                .collect();

            let reader_handles: Vec<_> = plans
                .into_iter()
                .enumerate()
                .map(|(reader, plans)| {
                    let mut checker = checker.empty_like();
                    scope.spawn(move || {
                        let tally = this.run_traversals(slice, reader, readers, &plans, &mut checker);
                        (tally, checker)
                    })
                })
                .collect();

            let mut outcomes = Vec::new();
            let mut ok = true;
            for handle in reader_handles {
                match handle.join() {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(_) => ok = false,
                }
            }
            writers_done.store(true, Ordering::Release);
            for handle in writer_handles {
                ok &= handle.join().is_ok();
            }
            (outcomes, ok)
        });

        let mut result = SimulationResult {
            seed,
            traversals: 0,
            completed: 0,
            stopped: 0,
            failed: 0,
            pairs_delivered: 0,
            leaf_rewrites: leaf_rewrites.load(Ordering::Acquire),
            invariant_violations: Vec::new(),
            store_stats: self.store.stats(),
            cache_stats: self.cache.stats(),
            completed_successfully: threads_ok,
            error: (!threads_ok).then(|| "a simulation thread panicked".to_string()),
        };
        for (tally, checker) in outcomes {
            result.traversals += tally.traversals;
            result.completed += tally.completed;
            result.stopped += tally.stopped;
            result.failed += tally.failed;
            result.pairs_delivered += tally.pairs_delivered;
            result
                .invariant_violations
                .extend_from_slice(checker.violations());
        }
        result
    }

    /// Issue `plans` one transaction each and check every result.
    fn run_traversals(
        &self,
        slice: BTreeSlice,
        reader: usize,
        readers: usize,
        plans: &[TraversalPlan],
        checker: &mut InvariantChecker,
    ) -> ReaderTally {
        let mut tally = ReaderTally::default();
        for (i, plan) in plans.iter().enumerate() {
            let operation_index = i * readers + reader;
            let txn = Transaction::begin(&self.cache);
            let mut collect = plan.stop_after.map_or_else(CollectPairs::new, CollectPairs::with_limit);
            let options = TraversalOptions {
                batch_size: plan.batch_size,
            };
            let result = slice.traverse_with(&txn, &plan.range, plan.direction, &mut collect, &options);

            tally.traversals += 1;
            match &result {
                Ok(TraversalOutcome::Completed) => tally.completed += 1,
                Ok(TraversalOutcome::Stopped) => tally.stopped += 1,
                Err(e) => {
                    tally.failed += 1;
                    tracing::debug!(operation_index, error = %e, "simulated traversal failed");
                }
            }
            tally.pairs_delivered += collect.pairs().len() as u64;

            let record = TraversalRecord {
                range: &plan.range,
                direction: plan.direction,
                stop_after: plan.stop_after,
                delivered: collect.pairs(),
                result: &result,
                locks_held_after: txn.locks_held(),
                peak_locks_held: txn.peak_locks_held(),
            };
            checker.check_traversal(operation_index, &record, &self.expected_keys(plan));
        }
        tally
    }

    /// Rewrite random leaves until `done`, keeping their keys and giving
    /// every value a new generation suffix.
    fn rewrite_leaves(
        &self,
        seed: u64,
        leaves: &[BlockId],
        done: &AtomicBool,
        rewrites: &AtomicU64,
    ) {
        if leaves.is_empty() {
            return;
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut generation = 0u64;
        while !done.load(Ordering::Acquire) {
            let leaf = leaves[rng.random_range(0..leaves.len())];
            generation += 1;
            match self.rewrite_leaf(leaf, generation) {
                Ok(()) => {
                    rewrites.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => tracing::debug!(leaf, error = %e, "simulated leaf rewrite failed"),
            }
            std::thread::yield_now();
        }
    }

    fn rewrite_leaf(&self, leaf: BlockId, generation: u64) -> Result<(), String> {
        let txn = Transaction::begin(&self.cache);
        let mut lock = txn.acquire(leaf, LockMode::Write).map_err(|e| e.to_string())?;

        let entries: Vec<(Vec<u8>, Vec<u8>)> = match Node::interpret(&lock) {
            Ok(Node::Leaf(node)) => node
                .entries()
                .iter()
                .map(|entry| {
                    let mut value = value_for(entry.key);
                    value.extend_from_slice(format!("#{generation}").as_bytes());
                    debug_assert!(value_matches(entry.key, &value));
                    (entry.key.to_vec(), value)
                })
                .collect(),
            Ok(Node::Internal(_)) => return Err(format!("block {leaf} is not a leaf")),
            Err(e) => return Err(e.to_string()),
        };

        let node = LeafNode::new(
            entries
                .iter()
                .map(|(key, value)| LeafEntry {
                    key: key.as_slice(),
                    value: value.as_slice(),
                })
                .collect(),
        )
        .map_err(|e| e.to_string())?;
        let mut page = self.cache.lease_page_zeroed().map_err(|e| e.to_string())?;
        node.write_to_page(&mut page).map_err(|e| e.to_string())?;
        lock.write_page(page).map_err(|e| e.to_string())
    }
}

/// Every leaf block of the tree, left to right.
fn collect_leaves(txn: &Transaction, slice: BTreeSlice) -> Result<Vec<BlockId>, TraversalError> {
    let root = slice.superblock(txn)?.root_block_id();
    if root == NULL_BLOCK_ID {
        return Ok(Vec::new());
    }

    let mut leaves = Vec::new();
    let mut level = vec![root];
    while !level.is_empty() {
        let mut next = Vec::new();
        for block_id in level {
            let lock = txn.acquire(block_id, LockMode::Read)?;
            match Node::interpret(&lock) {
                Ok(Node::Internal(node)) => next.extend_from_slice(node.children()),
                Ok(Node::Leaf(_)) => leaves.push(block_id),
                Err(source) => return Err(TraversalError::CorruptNode { block_id, source }),
            }
        }
        level = next;
    }
    Ok(leaves)
}
