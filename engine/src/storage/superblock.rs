//! Superblock structure and serialization.
//!
//! Each tree has one superblock block holding the root pointer and tree-wide
//! metadata. Traversals read it under a read lock to discover the root.

// PAGE_SIZE is a compile-time constant that fits in u32.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{BlockId, NULL_BLOCK_ID, PAGE_SIZE, Page};

/// Magic number identifying a B-tree superblock: "BTREESB1"
pub const MAGIC: [u8; 8] = *b"BTREESB1";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Page size as u32 for storage in superblock.
const PAGE_SIZE_U32: u32 = PAGE_SIZE as u32;

/// Superblock field offsets.
mod offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 8;
    pub const PAGE_SIZE: usize = 12;
    pub const CHECKSUM: usize = 16;
    pub const ROOT_BLOCK: usize = 24;
    pub const ENTRY_COUNT: usize = 32;
    pub const HEIGHT: usize = 40;
    // 44-8191: reserved
}

/// Something that knows where a tree's root lives.
pub trait RootProvider {
    /// Root block of the tree, or [`NULL_BLOCK_ID`] for an empty tree.
    fn root_block_id(&self) -> BlockId;
}

/// Tree-wide metadata stored in the superblock block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Format version number.
    pub format_version: u32,
    /// Page size in bytes (should always be `PAGE_SIZE`).
    pub page_size: u32,
    /// Root block of the tree (`NULL_BLOCK_ID` when empty).
    pub root_block_id: BlockId,
    /// Number of leaf entries in the tree.
    pub entry_count: u64,
    /// Number of node levels (0 for an empty tree, 1 for a single leaf).
    pub height: u32,
}

impl Superblock {
    /// Create a superblock for an empty tree.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            page_size: PAGE_SIZE_U32,
            root_block_id: NULL_BLOCK_ID,
            entry_count: 0,
            height: 0,
        }
    }

    /// Whether the tree has no root.
    #[must_use]
    pub const fn is_empty_tree(&self) -> bool {
        self.root_block_id == NULL_BLOCK_ID
    }

    /// Serialize the superblock into `page` (which should be zeroed).
    pub fn write_to_page(&self, page: &mut Page) {
        page.write_bytes(offsets::MAGIC, &MAGIC);
        page.write_u32(offsets::FORMAT_VERSION, self.format_version);
        page.write_u32(offsets::PAGE_SIZE, self.page_size);
        page.write_u64(offsets::ROOT_BLOCK, self.root_block_id);
        page.write_u64(offsets::ENTRY_COUNT, self.entry_count);
        page.write_u32(offsets::HEIGHT, self.height);
        page.seal_checksum_at(offsets::CHECKSUM);
    }

    /// Deserialize a superblock from a page.
    pub fn from_page(page: &Page) -> Result<Self, SuperblockError> {
        if page.read_bytes(offsets::MAGIC, MAGIC.len()) != MAGIC {
            return Err(SuperblockError::InvalidMagic);
        }

        let format_version = page.read_u32(offsets::FORMAT_VERSION);
        if format_version != FORMAT_VERSION {
            return Err(SuperblockError::UnsupportedVersion(format_version));
        }

        let page_size = page.read_u32(offsets::PAGE_SIZE);
        if page_size != PAGE_SIZE_U32 {
            return Err(SuperblockError::PageSizeMismatch {
                expected: PAGE_SIZE_U32,
                actual: page_size,
            });
        }

        page.verify_checksum_at(offsets::CHECKSUM)
            .map_err(|_| SuperblockError::ChecksumMismatch)?;

        Ok(Self {
            format_version,
            page_size,
            root_block_id: page.read_u64(offsets::ROOT_BLOCK),
            entry_count: page.read_u64(offsets::ENTRY_COUNT),
            height: page.read_u32(offsets::HEIGHT),
        })
    }
}

impl Default for Superblock {
    fn default() -> Self {
        Self::new()
    }
}

impl RootProvider for Superblock {
    fn root_block_id(&self) -> BlockId {
        self.root_block_id
    }
}

/// Errors that can occur when reading a superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuperblockError {
    /// Magic number mismatch (block is not a superblock).
    InvalidMagic,
    /// Unsupported format version.
    UnsupportedVersion(u32),
    /// Page size mismatch.
    PageSizeMismatch { expected: u32, actual: u32 },
    /// Stored checksum does not match the contents.
    ChecksumMismatch,
}

impl std::fmt::Display for SuperblockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid magic number"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::PageSizeMismatch { expected, actual } => {
                write!(f, "page size mismatch: expected {expected}, got {actual}")
            }
            Self::ChecksumMismatch => write!(f, "superblock checksum mismatch"),
        }
    }
}

impl std::error::Error for SuperblockError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superblock_roundtrip() {
        let superblock = Superblock {
            root_block_id: 17,
            entry_count: 1234,
            height: 3,
            ..Superblock::new()
        };

        let mut page = Page::new();
        superblock.write_to_page(&mut page);

        let restored = Superblock::from_page(&page).expect("should parse");
        assert_eq!(restored, superblock);
        assert_eq!(restored.root_block_id(), 17);
    }

    #[test]
    fn test_new_superblock_is_empty_tree() {
        let superblock = Superblock::new();
        assert!(superblock.is_empty_tree());
        assert_eq!(superblock.root_block_id(), NULL_BLOCK_ID);
    }

    #[test]
    fn test_zeroed_page_is_not_a_superblock() {
        let page = Page::new();
        assert_eq!(
            Superblock::from_page(&page),
            Err(SuperblockError::InvalidMagic)
        );
    }

    #[test]
    fn test_corrupt_root_pointer_detected() {
        let mut page = Page::new();
        Superblock::new().write_to_page(&mut page);
        page.write_u64(offsets::ROOT_BLOCK, 99);

        assert_eq!(
            Superblock::from_page(&page),
            Err(SuperblockError::ChecksumMismatch)
        );
    }
}
