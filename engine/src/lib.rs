// Life of a scan:
// 1. A request comes in and is validated (`protocol`)
// 2. It becomes a key range, a direction and a limit (`scan::ScanPlan`)
// 3. A blocking task opens a transaction and walks the tree:
//     - Read-lock the superblock, find the root
//     - Lock-couple down to the first leaf that intersects the range
//     - Hand pairs to the callback in batches
//     - Re-descend for the rest of the range until it is exhausted or the
//       callback says stop
// 4. Batches are streamed back to the async caller
//
// System components:
//  - Block store + buffer cache with per-block read/write locks (`storage`)
//  - Node codec, range model and traversal engine (`btree`)
//  - Async scan adapter (`scan`)
//  - Peer addressing (`net`)

pub mod btree;
pub mod config;
pub mod net;
pub mod protocol;
pub mod scan;
pub mod simulation;
pub mod storage;
#[cfg(test)]
mod testing;

pub use btree::{BTreeSlice, Direction, KeyRange, TraversalCallback, TraversalOutcome};
pub use scan::{ScanHandle, ScanPlan};
pub use storage::{BufferCache, Transaction};
