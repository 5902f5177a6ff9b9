//! Paged B-tree with range-bounded, lock-coupled traversal.
//!
//! # Structure
//!
//! - `keys`: byte keys, half-open ranges, traversal direction
//! - `node`: internal and leaf views over locked blocks
//! - `batch`: batched iteration of one leaf
//! - `traversal`: the depth-first walk and its callback protocol
//! - `loader`: builds a tree bottom-up from sorted entries
//! - `slice`: a handle to one tree
//!
//! # Usage
//!
//! ```ignore
//! let txn = Transaction::begin(&cache);
//! let slice = bulk_load(&txn, &entries, &LoadOptions::default())?;
//!
//! let range = KeyRange::half_open("b", "d")?;
//! let mut print = |key: &[u8], _value: &[u8]| {
//!     println!("{}", key.escape_ascii());
//!     true
//! };
//! slice.traverse(&txn, &range, Direction::Forward, &mut print)?;
//! ```

mod batch;
mod keys;
mod loader;
mod node;
mod slice;
mod traversal;

pub use batch::{BatchCursor, Pair};
pub use keys::{Direction, Key, KeyRange, KeyRangeError, MAX_KEY_SIZE, RightBound, compare};
pub use loader::{LoadError, LoadOptions, bulk_load};
pub use node::{InternalNode, LeafEntry, LeafIter, LeafNode, MAX_VALUE_SIZE, Node, NodeError};
pub use slice::BTreeSlice;
pub use traversal::{
    CollectPairs, DEFAULT_BATCH_SIZE, MAX_SUBTREE_DEPTH, TraversalCallback, TraversalError,
    TraversalOptions, TraversalOutcome, traverse, traverse_subtree, traverse_with,
};
