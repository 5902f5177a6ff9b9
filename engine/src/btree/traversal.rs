//! Depth-first, range-bounded traversal with lock-coupling.
//!
//! # Algorithm
//!
//! Each descent starts at the superblock (or at a given subtree root):
//!
//! 1. Read-lock the superblock, read the root id, lock the root, release the
//!    superblock.
//! 2. At an internal node, pick the first child in traversal order whose
//!    covered range intersects the remaining range. Lock the child, then
//!    release the parent.
//! 3. At a leaf, hand the in-range pairs to the callback in batches. A
//!    `false` return releases every lock and ends the walk as `Stopped`.
//! 4. Narrow the remaining range past the leaf's covered range, release the
//!    leaf, and descend again until nothing remains.
//!
//! # Invariants
//!
//! - At most two block locks (parent and child) are held at any instant.
//! - Pairs are delivered in strictly increasing key order for `Forward` and
//!   strictly decreasing order for `Backward`; the remaining range only ever
//!   shrinks, so no pair is delivered twice even if the tree changes between
//!   descents.
//! - Every exit path (completion, stop, error) releases all locks, because
//!   locks are guards owned by the walk's stack frame.

use crate::btree::batch::BatchCursor;
use crate::btree::keys::{Direction, KeyRange};
use crate::btree::node::{LeafNode, Node, NodeError};
use crate::storage::{
    BlockId, BlockLock, CacheError, LockMode, RootProvider, Superblock, SuperblockError,
    Transaction,
};

/// Default number of pairs pulled from a leaf per batch.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Deepest level a subtree walk descends to before giving up on the
/// subtree as cyclic.
pub const MAX_SUBTREE_DEPTH: u32 = 64;

/// How a traversal ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalOutcome {
    /// The range or the tree was exhausted.
    Completed,
    /// The callback asked to stop.
    Stopped,
}

impl TraversalOutcome {
    /// Whether the walk ran to the end of the range.
    #[must_use]
    pub const fn is_completed(self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Receives key-value pairs during a traversal.
///
/// Returning `false` stops the traversal before any further lock is taken.
/// Closures of type `FnMut(&[u8], &[u8]) -> bool` implement this trait; give
/// their parameters explicit `&[u8]` types so they accept any lifetime.
pub trait TraversalCallback {
    fn handle_pair(&mut self, key: &[u8], value: &[u8]) -> bool;
}

impl<F> TraversalCallback for F
where
    F: FnMut(&[u8], &[u8]) -> bool,
{
    fn handle_pair(&mut self, key: &[u8], value: &[u8]) -> bool {
        self(key, value)
    }
}

/// Callback that copies every pair it sees, optionally stopping after a
/// fixed number.
#[derive(Debug, Default, Clone)]
pub struct CollectPairs {
    pairs: Vec<(Vec<u8>, Vec<u8>)>,
    limit: Option<usize>,
}

impl CollectPairs {
    /// Collect every pair.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect at most `limit` pairs, then stop the traversal.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            pairs: Vec::new(),
            limit: Some(limit),
        }
    }

    /// Pairs collected so far.
    #[must_use]
    pub fn pairs(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.pairs
    }

    /// Keys collected so far.
    #[must_use]
    pub fn keys(&self) -> Vec<&[u8]> {
        self.pairs.iter().map(|(k, _)| k.as_slice()).collect()
    }

    /// Consume the collector, returning its pairs.
    #[must_use]
    pub fn into_pairs(self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.pairs
    }
}

impl TraversalCallback for CollectPairs {
    fn handle_pair(&mut self, key: &[u8], value: &[u8]) -> bool {
        self.pairs.push((key.to_vec(), value.to_vec()));
        self.limit.is_none_or(|limit| self.pairs.len() < limit)
    }
}

/// Tuning for a traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraversalOptions {
    /// Pairs pulled from a leaf per batch (minimum 1).
    pub batch_size: usize,
}

impl Default for TraversalOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Walk the tree rooted at `superblock_id`, delivering every pair in `range`
/// to `callback` in `direction` order.
///
/// # Pre-conditions
/// - `txn` is open
///
/// # Post-conditions
/// - No lock acquired by the walk is still held, whatever the outcome
/// - A tree whose internal nodes reach past the recorded height fails with
///   [`TraversalError::CorruptNode`]
pub fn traverse<C>(
    txn: &Transaction,
    superblock_id: BlockId,
    range: &KeyRange,
    direction: Direction,
    callback: &mut C,
) -> Result<TraversalOutcome, TraversalError>
where
    C: TraversalCallback + ?Sized,
{
    traverse_with(
        txn,
        superblock_id,
        range,
        direction,
        callback,
        &TraversalOptions::default(),
    )
}

/// [`traverse`] with explicit options.
pub fn traverse_with<C>(
    txn: &Transaction,
    superblock_id: BlockId,
    range: &KeyRange,
    direction: Direction,
    callback: &mut C,
    options: &TraversalOptions,
) -> Result<TraversalOutcome, TraversalError>
where
    C: TraversalCallback + ?Sized,
{
    let mut walk = Walk::new(txn, direction, callback, options);
    let result = walk.run(&Origin::Superblock(superblock_id), None, range.clone());
    walk.finish(superblock_id, range, &result);
    result
}

/// Walk the subtree held by `lock`, which covers `bounds`.
///
/// The walk owns `lock` and releases it like any other. Later descents
/// re-acquire the subtree root by block id.
pub fn traverse_subtree<'t, C>(
    txn: &'t Transaction,
    lock: BlockLock<'t>,
    bounds: &KeyRange,
    range: &KeyRange,
    callback: &mut C,
    direction: Direction,
) -> Result<TraversalOutcome, TraversalError>
where
    C: TraversalCallback + ?Sized,
{
    let block_id = lock.block_id();
    let origin = Origin::Subtree {
        block_id,
        bounds: bounds.clone(),
    };
    let mut walk = Walk::new(txn, direction, callback, &TraversalOptions::default());
    let result = walk.run(&origin, Some(lock), range.clip_to(bounds));
    walk.finish(block_id, range, &result);
    result
}

/// Where each descent starts.
enum Origin {
    Superblock(BlockId),
    Subtree { block_id: BlockId, bounds: KeyRange },
}

impl Origin {
    /// Depth limits for a descent. A superblock records the tree height; a
    /// subtree root does not know its own.
    const fn levels(&self, height: Option<u32>) -> Levels {
        match (self, height) {
            (Self::Superblock(_), Some(height)) => Levels {
                limit: height,
                exact: true,
            },
            _ => Levels {
                limit: MAX_SUBTREE_DEPTH,
                exact: false,
            },
        }
    }

    fn bounds(&self) -> KeyRange {
        match self {
            Self::Superblock(_) => KeyRange::universe(),
            Self::Subtree { bounds, .. } => bounds.clone(),
        }
    }
}

/// How deep a descent may go before the tree is treated as corrupt.
#[derive(Debug, Clone, Copy)]
struct Levels {
    /// Deepest level a node may sit at; the root is level 1.
    limit: u32,
    /// Leaves must sit exactly at `limit`.
    exact: bool,
}

/// Result of one descent.
enum Visit {
    /// A leaf covering this range was fully delivered.
    Drained(KeyRange),
    /// The callback stopped the walk.
    Stopped,
    /// No child intersects the remaining range.
    Exhausted,
}

struct Walk<'t, 'c, C: ?Sized> {
    txn: &'t Transaction,
    direction: Direction,
    batch_size: usize,
    callback: &'c mut C,
    descents: u64,
    nodes_visited: u64,
    pairs_delivered: u64,
}

impl<'t, 'c, C> Walk<'t, 'c, C>
where
    C: TraversalCallback + ?Sized,
{
    fn new(
        txn: &'t Transaction,
        direction: Direction,
        callback: &'c mut C,
        options: &TraversalOptions,
    ) -> Self {
        Self {
            txn,
            direction,
            batch_size: options.batch_size.max(1),
            callback,
            descents: 0,
            nodes_visited: 0,
            pairs_delivered: 0,
        }
    }

    fn run(
        &mut self,
        origin: &Origin,
        mut first: Option<BlockLock<'t>>,
        mut remaining: KeyRange,
    ) -> Result<TraversalOutcome, TraversalError> {
        loop {
            let start = match first.take() {
                Some(lock) => Some((lock, origin.levels(None))),
                None => self.open_origin(origin, &remaining)?,
            };
            let Some((root, levels)) = start else {
                return Ok(TraversalOutcome::Completed);
            };

            self.descents += 1;
            match self.descend(root, origin.bounds(), &remaining, levels)? {
                Visit::Stopped => return Ok(TraversalOutcome::Stopped),
                Visit::Exhausted => return Ok(TraversalOutcome::Completed),
                Visit::Drained(leaf_bounds) => {
                    remaining = remaining.remainder_after(&leaf_bounds, self.direction);
                    if remaining.is_empty() {
                        return Ok(TraversalOutcome::Completed);
                    }
                }
            }
        }
    }

    /// Lock the block the next descent starts from, or `None` when there is
    /// nothing to walk.
    fn open_origin(
        &self,
        origin: &Origin,
        remaining: &KeyRange,
    ) -> Result<Option<(BlockLock<'t>, Levels)>, TraversalError> {
        match origin {
            Origin::Superblock(superblock_id) => {
                let superblock_lock = self.txn.acquire(*superblock_id, LockMode::Read)?;
                if remaining.is_empty() {
                    return Ok(None);
                }
                let superblock = Superblock::from_page(superblock_lock.page()).map_err(|source| {
                    tracing::error!(block_id = superblock_id, error = %source, "corrupt superblock");
                    TraversalError::CorruptSuperblock {
                        block_id: *superblock_id,
                        source,
                    }
                })?;
                if superblock.is_empty_tree() {
                    return Ok(None);
                }
                let root = self
                    .txn
                    .acquire(superblock.root_block_id(), LockMode::Read)?;
                drop(superblock_lock);
                Ok(Some((root, origin.levels(Some(superblock.height)))))
            }
            Origin::Subtree { block_id, .. } => {
                if remaining.is_empty() {
                    return Ok(None);
                }
                let root = self.txn.acquire(*block_id, LockMode::Read)?;
                Ok(Some((root, origin.levels(None))))
            }
        }
    }

    fn descend(
        &mut self,
        mut lock: BlockLock<'t>,
        mut bounds: KeyRange,
        remaining: &KeyRange,
        levels: Levels,
    ) -> Result<Visit, TraversalError> {
        let mut depth = 1u32;
        loop {
            let block_id = lock.block_id();
            self.nodes_visited += 1;

            let (child_id, child_bounds) =
                match Node::interpret(&lock).map_err(|source| corrupt_node(block_id, source))? {
                    Node::Leaf(leaf) => {
                        if levels.exact && depth != levels.limit {
                            let source = NodeError::LeafDepthMismatch {
                                depth,
                                height: levels.limit,
                            };
                            return Err(corrupt_node(block_id, source));
                        }
                        return Ok(self.scan_leaf(block_id, &leaf, bounds, remaining));
                    }
                    Node::Internal(internal) => {
                        if depth >= levels.limit {
                            let source = NodeError::TooDeep {
                                depth,
                                limit: levels.limit,
                            };
                            return Err(corrupt_node(block_id, source));
                        }
                        match internal.first_child_in(remaining, self.direction, &bounds) {
                            Some(next) => next,
                            None => return Ok(Visit::Exhausted),
                        }
                    }
                };

            tracing::trace!(
                txn = self.txn.id(),
                parent = block_id,
                child = child_id,
                bounds = %child_bounds,
                "descending"
            );
            let child = self.txn.acquire(child_id, LockMode::Read)?;
            drop(std::mem::replace(&mut lock, child));
            bounds = child_bounds;
            depth += 1;
        }
    }

    fn scan_leaf(
        &mut self,
        block_id: BlockId,
        leaf: &LeafNode<'_>,
        bounds: KeyRange,
        remaining: &KeyRange,
    ) -> Visit {
        let window = remaining.clip_to(&bounds);
        let mut cursor = BatchCursor::new(leaf, &window, self.direction);
        loop {
            let batch = cursor.next_batch(self.batch_size);
            if batch.is_empty() {
                return Visit::Drained(bounds);
            }
            for (key, value) in batch {
                self.pairs_delivered += 1;
                if !self.callback.handle_pair(key, value) {
                    tracing::trace!(txn = self.txn.id(), block_id, "callback stopped traversal");
                    return Visit::Stopped;
                }
            }
        }
    }

    fn finish(
        &self,
        start: BlockId,
        range: &KeyRange,
        result: &Result<TraversalOutcome, TraversalError>,
    ) {
        match result {
            Ok(outcome) => tracing::debug!(
                txn = self.txn.id(),
                start,
                %range,
                direction = ?self.direction,
                ?outcome,
                descents = self.descents,
                nodes_visited = self.nodes_visited,
                pairs = self.pairs_delivered,
                "traversal finished"
            ),
            Err(e) => tracing::debug!(
                txn = self.txn.id(),
                start,
                %range,
                error = %e,
                pairs = self.pairs_delivered,
                "traversal failed"
            ),
        }
    }
}

fn corrupt_node(block_id: BlockId, source: NodeError) -> TraversalError {
    tracing::error!(block_id, error = %source, "corrupt node");
    TraversalError::CorruptNode { block_id, source }
}

/// Errors that can abort a traversal.
#[derive(Debug)]
pub enum TraversalError {
    /// A referenced block does not exist.
    BlockNotFound(BlockId),
    /// A block could not be interpreted as a node.
    CorruptNode { block_id: BlockId, source: NodeError },
    /// The superblock could not be read.
    CorruptSuperblock {
        block_id: BlockId,
        source: SuperblockError,
    },
    /// The transaction was closed.
    TransactionClosed,
    /// Any other buffer cache failure.
    Cache(CacheError),
}

impl std::fmt::Display for TraversalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlockNotFound(id) => write!(f, "block {id} not found"),
            Self::CorruptNode { block_id, source } => {
                write!(f, "corrupt node in block {block_id}: {source}")
            }
            Self::CorruptSuperblock { block_id, source } => {
                write!(f, "corrupt superblock in block {block_id}: {source}")
            }
            Self::TransactionClosed => write!(f, "transaction is closed"),
            Self::Cache(e) => write!(f, "cache error: {e}"),
        }
    }
}

impl std::error::Error for TraversalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CorruptNode { source, .. } => Some(source),
            Self::CorruptSuperblock { source, .. } => Some(source),
            Self::Cache(e) => Some(e),
            Self::BlockNotFound(_) | Self::TransactionClosed => None,
        }
    }
}

impl From<CacheError> for TraversalError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::BlockNotFound(id) => Self::BlockNotFound(id),
            CacheError::TransactionClosed => Self::TransactionClosed,
            other => Self::Cache(other),
        }
    }
}
