//! Bottom-up bulk loading of a tree from sorted entries.
//!
//! The loader only writes fresh blocks: it packs leaves left to right, builds
//! each internal level over the one below, and finally writes the superblock.
//! The superblock block is allocated first, so a loader run on an empty
//! store places it at block 0.

use crate::btree::node::{InternalNode, LeafEntry, LeafNode, NodeError};
use crate::btree::slice::BTreeSlice;
use crate::storage::{
    BlockId, CacheError, LockMode, NULL_BLOCK_ID, PAGE_SIZE, Page, Superblock, Transaction,
};

/// Shape limits for a bulk load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Maximum entries per leaf (minimum 1).
    pub max_leaf_entries: usize,
    /// Maximum children per internal node (minimum 2).
    pub max_fanout: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            max_leaf_entries: 128,
            max_fanout: 128,
        }
    }
}

/// Build a tree holding `entries`, which must be sorted by key with no
/// duplicates.
///
/// Leaves and internal nodes are also limited by block size, so a node may
/// hold fewer entries than the options allow.
pub fn bulk_load<K, V>(
    txn: &Transaction,
    entries: &[(K, V)],
    options: &LoadOptions,
) -> Result<BTreeSlice, LoadError>
where
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    if options.max_leaf_entries == 0 {
        return Err(LoadError::InvalidOptions("max_leaf_entries must be at least 1"));
    }
    if options.max_fanout < 2 {
        return Err(LoadError::InvalidOptions("max_fanout must be at least 2"));
    }
    if let Some(index) = entries
        .windows(2)
        .position(|pair| pair[0].0.as_ref() >= pair[1].0.as_ref())
    {
        return Err(LoadError::Unsorted { index: index + 1 });
    }

    let superblock_id = txn.cache().allocate_block()?;

    let mut level = write_leaves(txn, entries, options)?;
    let mut height = u32::from(!level.is_empty());
    while level.len() > 1 {
        level = write_internal_level(txn, &level, options)?;
        height += 1;
    }

    let superblock = Superblock {
        root_block_id: level.first().map_or(NULL_BLOCK_ID, |(id, _)| *id),
        entry_count: entries.len() as u64,
        height,
        ..Superblock::new()
    };
    write_block(txn, superblock_id, |page| {
        superblock.write_to_page(page);
        Ok(())
    })?;

    tracing::debug!(
        superblock_id,
        root = superblock.root_block_id,
        entries = entries.len(),
        height,
        "bulk load finished"
    );
    Ok(BTreeSlice::new(superblock_id))
}

/// A written node and the smallest key beneath it.
type LevelEntry<'e> = (BlockId, &'e [u8]);

fn write_leaves<'e, K, V>(
    txn: &Transaction,
    entries: &'e [(K, V)],
    options: &LoadOptions,
) -> Result<Vec<LevelEntry<'e>>, LoadError>
where
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let mut level = Vec::new();
    let mut rest = entries;
    while !rest.is_empty() {
        let mut size = LeafNode::EMPTY_SIZE;
        let mut take = 0;
        for (key, value) in rest.iter().take(options.max_leaf_entries) {
            let entry_size = LeafNode::entry_size(key.as_ref(), value.as_ref());
            if take > 0 && size + entry_size > PAGE_SIZE {
                break;
            }
            size += entry_size;
            take += 1;
        }

        let (chunk, tail) = rest.split_at(take);
        let leaf = LeafNode::new(
            chunk
                .iter()
                .map(|(key, value)| LeafEntry {
                    key: key.as_ref(),
                    value: value.as_ref(),
                })
                .collect(),
        )?;
        let block_id = write_new_block(txn, |page| leaf.write_to_page(page))?;
        level.push((block_id, chunk[0].0.as_ref()));
        rest = tail;
    }
    Ok(level)
}

fn write_internal_level<'e>(
    txn: &Transaction,
    children: &[LevelEntry<'e>],
    options: &LoadOptions,
) -> Result<Vec<LevelEntry<'e>>, LoadError> {
    let mut level = Vec::new();
    let mut rest = children;
    while !rest.is_empty() {
        let mut size = InternalNode::EMPTY_SIZE;
        let mut take = 1;
        for (_, first_key) in rest.iter().take(options.max_fanout).skip(1) {
            let entry_size = InternalNode::entry_size(first_key);
            if size + entry_size > PAGE_SIZE {
                break;
            }
            size += entry_size;
            take += 1;
        }

        let (group, tail) = rest.split_at(take);
        let node = InternalNode::new(
            group[1..].iter().map(|(_, key)| *key).collect(),
            group.iter().map(|(id, _)| *id).collect(),
        )?;
        let block_id = write_new_block(txn, |page| node.write_to_page(page))?;
        level.push((block_id, group[0].1));
        rest = tail;
    }
    Ok(level)
}

fn write_new_block(
    txn: &Transaction,
    fill: impl FnOnce(&mut Page) -> Result<(), NodeError>,
) -> Result<BlockId, LoadError> {
    let block_id = txn.cache().allocate_block()?;
    write_block(txn, block_id, fill)?;
    Ok(block_id)
}

fn write_block(
    txn: &Transaction,
    block_id: BlockId,
    fill: impl FnOnce(&mut Page) -> Result<(), NodeError>,
) -> Result<(), LoadError> {
    let mut lock = txn.acquire(block_id, LockMode::Write)?;
    let mut page = txn.cache().lease_page_zeroed()?;
    fill(&mut page)?;
    lock.write_page(page)?;
    Ok(())
}

/// Errors that can occur during a bulk load.
#[derive(Debug)]
pub enum LoadError {
    /// Entry at `index` is not greater than its predecessor.
    Unsorted { index: usize },
    /// Load options are out of range.
    InvalidOptions(&'static str),
    /// An entry or node could not be encoded.
    Node(NodeError),
    /// Buffer cache failure.
    Cache(CacheError),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsorted { index } => {
                write!(f, "entry {index} is not greater than the entry before it")
            }
            Self::InvalidOptions(msg) => write!(f, "invalid load options: {msg}"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::Cache(e) => write!(f, "cache error: {e}"),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Node(e) => Some(e),
            Self::Cache(e) => Some(e),
            Self::Unsorted { .. } | Self::InvalidOptions(_) => None,
        }
    }
}

impl From<NodeError> for LoadError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

impl From<CacheError> for LoadError {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}
