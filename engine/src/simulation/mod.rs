//! Deterministic Simulation Testing (DST) infrastructure.
//!
//! This module provides tools for testing the traversal engine with:
//! - An in-memory block store with fault injection
//! - Reproducible random trees and traversal requests
//! - Invariant checking after every traversal
//!
//! # Design Principles
//!
//! 1. All block I/O goes through a `BlockStore` and can be simulated
//! 2. All randomness is seeded for reproducibility
//! 3. Faults can be injected at any read, write or sync
//! 4. Given the same seed and a single reader thread, execution is identical
//!
//! # Usage
//!
//! ```ignore
//! use engine::simulation::{FaultConfig, Simulator, SimulatorConfig};
//!
//! let config = SimulatorConfig::new(12345) // seed
//!     .with_fault_config(FaultConfig::low_faults())
//!     .with_threads(2, 1);
//!
//! let mut sim = Simulator::new(config);
//! let result = sim.run(1000); // Run 1000 traversals
//!
//! assert!(result.invariant_violations.is_empty());
//! ```

mod invariants;
mod simulator;
mod storage;

pub use invariants::{
    InvariantChecker, InvariantViolation, MAX_LOCKS_HELD, TraversalRecord, value_for,
    value_matches,
};
pub use simulator::{SimulationResult, Simulator, SimulatorConfig};
pub use storage::{FaultConfig, SimulatedStore, SimulatedStoreStats};
