//! B-tree node types and serialization.
//!
//! Nodes are views over a locked block's page: keys and values borrow the
//! page bytes, so a node (and anything iterating it) cannot outlive the lock
//! that protects the block.
//!
//! Layout after the common page header:
//! - `key_count`: 2 bytes
//! - Internal: `child0` (8 bytes), then `key_count` x (`len` u16, key, child u64)
//! - Leaf: `key_count` x (`key_len` u16, key, `value_len` u16, value)
//!
//! Child `i` of an internal node covers `[sep[i-1], sep[i])`, intersected with
//! the node's own range; a key equal to a separator belongs to the right child.

// Sizes are bounded by PAGE_SIZE before narrowing.
#![allow(clippy::cast_possible_truncation)]

use crate::btree::keys::{Direction, Key, KeyRange, MAX_KEY_SIZE, RightBound};
use crate::storage::{
    BlockId, BlockLock, NULL_BLOCK_ID, PAGE_SIZE, Page, PageError, PageHeader, PageType,
};

/// Maximum value size stored in a leaf.
pub const MAX_VALUE_SIZE: usize = 1024;

/// Offset of the `key_count` field.
const KEY_COUNT_OFFSET: usize = PageHeader::SIZE;

/// Offset where node data starts.
const DATA_OFFSET: usize = KEY_COUNT_OFFSET + 2;

/// A node interpreted from a locked block.
#[derive(Debug)]
pub enum Node<'a> {
    Internal(InternalNode<'a>),
    Leaf(LeafNode<'a>),
}

impl<'a> Node<'a> {
    /// Interpret the block held by `lock`.
    ///
    /// Fails if the tag is unknown, the checksum does not match, the layout
    /// overruns the block, or keys are not strictly increasing.
    pub fn interpret(lock: &'a BlockLock<'_>) -> Result<Self, NodeError> {
        Self::from_page(lock.page())
    }

    /// Interpret a page as a node.
    pub fn from_page(page: &'a Page) -> Result<Self, NodeError> {
        let bytes = page.as_bytes();
        let mut header = [0u8; PageHeader::SIZE];
        header.copy_from_slice(&bytes[..PageHeader::SIZE]);
        let header = PageHeader::from_bytes(header)?;
        page.verify_checksum_at(PageHeader::CHECKSUM_OFFSET)?;

        let count = usize::from(page.read_u16(KEY_COUNT_OFFSET));
        let mut reader = Reader {
            bytes,
            offset: DATA_OFFSET,
        };
        match header.page_type {
            PageType::BTreeInternal => InternalNode::decode(&mut reader, count).map(Self::Internal),
            PageType::BTreeLeaf => LeafNode::decode(&mut reader, count).map(Self::Leaf),
        }
    }

    /// Whether this is a leaf.
    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }
}

/// An internal node: `n` separators and `n + 1` children.
#[derive(Debug, Clone)]
pub struct InternalNode<'a> {
    separators: Vec<&'a [u8]>,
    children: Vec<BlockId>,
}

impl<'a> InternalNode<'a> {
    /// Bytes used by an internal node with no separators.
    pub const EMPTY_SIZE: usize = DATA_OFFSET + 8;

    /// Create an internal node.
    ///
    /// # Pre-conditions
    /// - `children.len() == separators.len() + 1`
    /// - Separators are strictly increasing
    /// - No child is `NULL_BLOCK_ID`
    pub fn new(separators: Vec<&'a [u8]>, children: Vec<BlockId>) -> Result<Self, NodeError> {
        if children.len() != separators.len() + 1 {
            return Err(NodeError::ChildCountMismatch {
                separators: separators.len(),
                children: children.len(),
            });
        }
        if let Some(index) = children.iter().position(|&c| c == NULL_BLOCK_ID) {
            return Err(NodeError::NullChild { index });
        }
        check_keys(&separators)?;
        Ok(Self {
            separators,
            children,
        })
    }

    fn decode(reader: &mut Reader<'a>, count: usize) -> Result<Self, NodeError> {
        let mut separators = Vec::with_capacity(count);
        let mut children = Vec::with_capacity(count + 1);
        children.push(reader.u64()?);
        for _ in 0..count {
            let len = reader.u16()?;
            separators.push(reader.take(len)?);
            children.push(reader.u64()?);
        }
        Self::new(separators, children)
    }

    /// Bytes used by one separator and its right child.
    #[must_use]
    pub const fn entry_size(separator: &[u8]) -> usize {
        2 + separator.len() + 8
    }

    /// Bytes this node occupies when written.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        Self::EMPTY_SIZE
            + self
                .separators
                .iter()
                .map(|s| Self::entry_size(s))
                .sum::<usize>()
    }

    /// Number of children.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Always false; an internal node has at least one child.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::is_empty() is not const-stable
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Separator keys in order.
    #[must_use]
    pub fn separators(&self) -> &[&'a [u8]] {
        &self.separators
    }

    /// Child block ids in order.
    #[must_use]
    pub fn children(&self) -> &[BlockId] {
        &self.children
    }

    /// Index of the child whose subtree would hold `key`.
    #[must_use]
    pub fn child_index_for(&self, key: &[u8]) -> usize {
        self.separators.partition_point(|s| *s <= key)
    }

    /// The child holding `key` and the range it covers, given the node's own
    /// covered `bounds`.
    #[must_use]
    pub fn child_for(&self, key: &[u8], bounds: &KeyRange) -> (BlockId, KeyRange) {
        let index = self.child_index_for(key);
        (self.children[index], self.child_range(index, bounds))
    }

    /// Range covered by child `index`, given the node's own covered `bounds`.
    #[must_use]
    pub fn child_range(&self, index: usize, bounds: &KeyRange) -> KeyRange {
        let left = match index.checked_sub(1) {
            Some(prev) => Key::from(self.separators[prev]),
            None => bounds.left().clone(),
        };
        let right = self
            .separators
            .get(index)
            .map_or_else(|| bounds.right().clone(), |s| RightBound::Exclusive(Key::from(*s)));
        KeyRange::clamped(left, right).clip_to(bounds)
    }

    /// The first child, in `direction` order, whose covered range intersects
    /// `range`, with that covered range.
    #[must_use]
    pub fn first_child_in(
        &self,
        range: &KeyRange,
        direction: Direction,
        bounds: &KeyRange,
    ) -> Option<(BlockId, KeyRange)> {
        if range.is_empty() {
            return None;
        }
        let qualifying = |index: usize| {
            let covered = self.child_range(index, bounds);
            covered
                .intersects(range)
                .then_some((self.children[index], covered))
        };
        match direction {
            Direction::Forward => {
                let start = self.child_index_for(range.left().as_bytes());
                (start..self.children.len()).find_map(qualifying)
            }
            Direction::Backward => {
                let end = match range.right() {
                    RightBound::Exclusive(r) => {
                        self.separators.partition_point(|s| *s < r.as_bytes())
                    }
                    RightBound::Unbounded => self.separators.len(),
                };
                (0..=end).rev().find_map(qualifying)
            }
        }
    }

    /// Serialize into `page` and seal its checksum.
    pub fn write_to_page(&self, page: &mut Page) -> Result<(), NodeError> {
        let size = self.encoded_size();
        if size > PAGE_SIZE {
            return Err(NodeError::NodeFull {
                needed: size,
                available: PAGE_SIZE,
            });
        }

        write_header(page, PageType::BTreeInternal, self.separators.len());
        let mut offset = DATA_OFFSET;
        page.write_u64(offset, self.children[0]);
        offset += 8;
        for (separator, child) in self.separators.iter().zip(&self.children[1..]) {
            page.write_u16(offset, separator.len() as u16);
            offset += 2;
            page.write_bytes(offset, separator);
            offset += separator.len();
            page.write_u64(offset, *child);
            offset += 8;
        }
        page.seal_checksum_at(PageHeader::CHECKSUM_OFFSET);
        Ok(())
    }
}

/// A key-value pair stored in a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafEntry<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// A leaf node: strictly increasing key-value pairs.
#[derive(Debug, Clone)]
pub struct LeafNode<'a> {
    entries: Vec<LeafEntry<'a>>,
}

impl<'a> LeafNode<'a> {
    /// Bytes used by a leaf with no entries.
    pub const EMPTY_SIZE: usize = DATA_OFFSET;

    /// Create a leaf from entries sorted by key.
    pub fn new(entries: Vec<LeafEntry<'a>>) -> Result<Self, NodeError> {
        if let Some(entry) = entries.iter().find(|e| e.value.len() > MAX_VALUE_SIZE) {
            return Err(NodeError::ValueTooLarge(entry.value.len()));
        }
        let keys: Vec<&[u8]> = entries.iter().map(|e| e.key).collect();
        check_keys(&keys)?;
        Ok(Self { entries })
    }

    fn decode(reader: &mut Reader<'a>, count: usize) -> Result<Self, NodeError> {
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key_len = reader.u16()?;
            let key = reader.take(key_len)?;
            let value_len = reader.u16()?;
            let value = reader.take(value_len)?;
            entries.push(LeafEntry { key, value });
        }
        Self::new(entries)
    }

    /// Bytes used by one entry.
    #[must_use]
    pub const fn entry_size(key: &[u8], value: &[u8]) -> usize {
        2 + key.len() + 2 + value.len()
    }

    /// Bytes this leaf occupies when written.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        Self::EMPTY_SIZE
            + self
                .entries
                .iter()
                .map(|e| Self::entry_size(e.key, e.value))
                .sum::<usize>()
    }

    /// Number of entries.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the leaf has no entries.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::is_empty() is not const-stable
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in key order.
    #[must_use]
    pub fn entries(&self) -> &[LeafEntry<'a>] {
        &self.entries
    }

    /// Look up a value by exact key.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&'a [u8]> {
        self.entries
            .binary_search_by(|e| e.key.cmp(key))
            .ok()
            .map(|i| self.entries[i].value)
    }

    /// Lazily iterate the entries inside `range`, ascending for `Forward` and
    /// descending for `Backward`.
    #[must_use]
    pub fn iterate(&self, range: &KeyRange, direction: Direction) -> LeafIter<'_, 'a> {
        let start = self
            .entries
            .partition_point(|e| e.key < range.left().as_bytes());
        let end = match range.right() {
            RightBound::Exclusive(r) => self.entries.partition_point(|e| e.key < r.as_bytes()),
            RightBound::Unbounded => self.entries.len(),
        };
        LeafIter {
            inner: self.entries[start..end.max(start)].iter(),
            direction,
        }
    }

    /// Serialize into `page` and seal its checksum.
    pub fn write_to_page(&self, page: &mut Page) -> Result<(), NodeError> {
        let size = self.encoded_size();
        if size > PAGE_SIZE {
            return Err(NodeError::NodeFull {
                needed: size,
                available: PAGE_SIZE,
            });
        }

        write_header(page, PageType::BTreeLeaf, self.entries.len());
        let mut offset = DATA_OFFSET;
        for entry in &self.entries {
            page.write_u16(offset, entry.key.len() as u16);
            offset += 2;
            page.write_bytes(offset, entry.key);
            offset += entry.key.len();
            page.write_u16(offset, entry.value.len() as u16);
            offset += 2;
            page.write_bytes(offset, entry.value);
            offset += entry.value.len();
        }
        page.seal_checksum_at(PageHeader::CHECKSUM_OFFSET);
        Ok(())
    }
}

/// Iterator over a leaf's entries within a range.
///
/// Borrows the leaf, which borrows the block lock.
#[derive(Debug, Clone)]
pub struct LeafIter<'n, 'a> {
    inner: std::slice::Iter<'n, LeafEntry<'a>>,
    direction: Direction,
}

impl<'a> Iterator for LeafIter<'_, 'a> {
    type Item = LeafEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.direction {
            Direction::Forward => self.inner.next().copied(),
            Direction::Backward => self.inner.next_back().copied(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for LeafIter<'_, '_> {}

impl std::iter::FusedIterator for LeafIter<'_, '_> {}

fn write_header(page: &mut Page, page_type: PageType, count: usize) {
    let header = PageHeader {
        page_type,
        flags: 0,
        checksum: 0,
    };
    page.write_bytes(0, &header.to_bytes());
    page.write_u16(KEY_COUNT_OFFSET, count as u16);
}

fn check_keys(keys: &[&[u8]]) -> Result<(), NodeError> {
    if let Some(key) = keys.iter().find(|k| k.len() > MAX_KEY_SIZE) {
        return Err(NodeError::KeyTooLarge(key.len()));
    }
    match keys.windows(2).position(|pair| pair[0] >= pair[1]) {
        Some(index) => Err(NodeError::KeysOutOfOrder { index: index + 1 }),
        None => Ok(()),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], NodeError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(NodeError::Truncated {
                offset: self.offset,
            })?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<usize, NodeError> {
        let bytes = self.take(2)?;
        Ok(usize::from(u16::from_le_bytes([bytes[0], bytes[1]])))
    }

    fn u64(&mut self) -> Result<u64, NodeError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }
}

/// Errors that can occur when interpreting or building nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// The block's type tag is not a node type.
    InvalidPageType(u8),
    /// The block's checksum does not match its contents.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// The layout runs past the end of the block.
    Truncated { offset: usize },
    /// Key at `index` is not greater than its predecessor.
    KeysOutOfOrder { index: usize },
    /// Child pointer at `index` is null.
    NullChild { index: usize },
    /// Children count is not separators + 1.
    ChildCountMismatch { separators: usize, children: usize },
    /// Key exceeds `MAX_KEY_SIZE`.
    KeyTooLarge(usize),
    /// Value exceeds `MAX_VALUE_SIZE`.
    ValueTooLarge(usize),
    /// Node does not fit in one block.
    NodeFull { needed: usize, available: usize },
    /// An internal node sits at the deepest level a leaf may occupy.
    TooDeep { depth: u32, limit: u32 },
    /// A leaf sits at a level other than the tree's height.
    LeafDepthMismatch { depth: u32, height: u32 },
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPageType(tag) => write!(f, "invalid node type tag: 0x{tag:02x}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
            Self::Truncated { offset } => write!(f, "node layout truncated at offset {offset}"),
            Self::KeysOutOfOrder { index } => write!(f, "key {index} is out of order"),
            Self::NullChild { index } => write!(f, "child {index} is null"),
            Self::ChildCountMismatch {
                separators,
                children,
            } => write!(
                f,
                "{children} children for {separators} separators (expected {})",
                separators + 1
            ),
            Self::KeyTooLarge(size) => {
                write!(f, "key too large: {size} bytes (max {MAX_KEY_SIZE})")
            }
            Self::ValueTooLarge(size) => {
                write!(f, "value too large: {size} bytes (max {MAX_VALUE_SIZE})")
            }
            Self::NodeFull { needed, available } => {
                write!(f, "node needs {needed} bytes, block has {available}")
            }
            Self::TooDeep { depth, limit } => {
                write!(f, "internal node at level {depth}, leaves expected by level {limit}")
            }
            Self::LeafDepthMismatch { depth, height } => {
                write!(f, "leaf at level {depth} in a tree of height {height}")
            }
        }
    }
}

impl std::error::Error for NodeError {}

impl From<PageError> for NodeError {
    fn from(e: PageError) -> Self {
        match e {
            PageError::InvalidPageType(tag) => Self::InvalidPageType(tag),
            PageError::ChecksumMismatch { expected, actual } => {
                Self::ChecksumMismatch { expected, actual }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_page(pairs: &[(&str, &str)]) -> Page {
        let entries = pairs
            .iter()
            .map(|(k, v)| LeafEntry {
                key: k.as_bytes(),
                value: v.as_bytes(),
            })
            .collect();
        let mut page = Page::new();
        LeafNode::new(entries)
            .expect("valid leaf")
            .write_to_page(&mut page)
            .expect("fits");
        page
    }

    fn internal(separators: &[&'static str], children: &[BlockId]) -> InternalNode<'static> {
        InternalNode::new(
            separators.iter().copied().map(str::as_bytes).collect(),
            children.to_vec(),
        )
        .expect("valid internal node")
    }

    fn keys_of(iter: LeafIter<'_, '_>) -> Vec<String> {
        iter.map(|e| String::from_utf8_lossy(e.key).into_owned())
            .collect()
    }

    #[test]
    fn test_leaf_roundtrip() {
        let page = leaf_page(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let Node::Leaf(leaf) = Node::from_page(&page).expect("valid") else {
            panic!("expected leaf");
        };
        assert_eq!(leaf.len(), 3);
        assert_eq!(leaf.get(b"b"), Some(&b"2"[..]));
        assert_eq!(leaf.get(b"bb"), None);
    }

    #[test]
    fn test_internal_roundtrip() {
        let node = internal(&["g", "p"], &[3, 4, 5]);
        let mut page = Page::new();
        node.write_to_page(&mut page).expect("fits");

        let Node::Internal(decoded) = Node::from_page(&page).expect("valid") else {
            panic!("expected internal node");
        };
        assert_eq!(decoded.children(), &[3, 4, 5]);
        assert_eq!(decoded.separators(), &[&b"g"[..], &b"p"[..]]);
    }

    #[test]
    fn test_separator_belongs_to_right_child() {
        let node = internal(&["g", "p"], &[3, 4, 5]);
        let universe = KeyRange::universe();

        assert_eq!(node.child_for(b"a", &universe).0, 3);
        assert_eq!(node.child_for(b"g", &universe).0, 4);
        assert_eq!(node.child_for(b"o", &universe).0, 4);
        assert_eq!(node.child_for(b"p", &universe).0, 5);
        assert_eq!(node.child_for(b"z", &universe).0, 5);
    }

    #[test]
    fn test_child_range_is_clipped_to_bounds() {
        let node = internal(&["g", "p"], &[3, 4, 5]);
        let bounds = KeyRange::half_open("c", "x").expect("valid");

        assert_eq!(
            node.child_range(0, &bounds),
            KeyRange::half_open("c", "g").expect("valid")
        );
        assert_eq!(
            node.child_range(1, &bounds),
            KeyRange::half_open("g", "p").expect("valid")
        );
        assert_eq!(
            node.child_range(2, &bounds),
            KeyRange::half_open("p", "x").expect("valid")
        );
    }

    #[test]
    fn test_first_child_in_by_direction() {
        let node = internal(&["g", "p"], &[3, 4, 5]);
        let universe = KeyRange::universe();
        let range = KeyRange::half_open("h", "q").expect("valid");

        let (forward, _) = node
            .first_child_in(&range, Direction::Forward, &universe)
            .expect("forward child");
        let (backward, _) = node
            .first_child_in(&range, Direction::Backward, &universe)
            .expect("backward child");
        assert_eq!(forward, 4);
        assert_eq!(backward, 5);

        // Right bound equal to a separator excludes the right child.
        let range = KeyRange::half_open("a", "p").expect("valid");
        let (backward, _) = node
            .first_child_in(&range, Direction::Backward, &universe)
            .expect("backward child");
        assert_eq!(backward, 4);

        assert!(
            node.first_child_in(&KeyRange::empty(), Direction::Forward, &universe)
                .is_none()
        );
    }

    #[test]
    fn test_leaf_iterate_range_and_direction() {
        let page = leaf_page(&[("a", ""), ("b", ""), ("c", ""), ("d", "")]);
        let Node::Leaf(leaf) = Node::from_page(&page).expect("valid") else {
            panic!("expected leaf");
        };
        let range = KeyRange::half_open("b", "d").expect("valid");

        assert_eq!(keys_of(leaf.iterate(&range, Direction::Forward)), ["b", "c"]);
        assert_eq!(keys_of(leaf.iterate(&range, Direction::Backward)), ["c", "b"]);

        let outside = KeyRange::half_open("x", "z").expect("valid");
        assert_eq!(leaf.iterate(&outside, Direction::Forward).len(), 0);
    }

    #[test]
    fn test_checksum_mismatch_is_detected() {
        let mut page = leaf_page(&[("a", "1")]);
        page.write_u8(DATA_OFFSET + 2, b'z');

        assert!(matches!(
            Node::from_page(&page),
            Err(NodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let page = Page::new();
        assert_eq!(
            Node::from_page(&page).map(|_| ()),
            Err(NodeError::InvalidPageType(0))
        );
    }

    #[test]
    fn test_out_of_order_keys_rejected() {
        let entries = vec![
            LeafEntry { key: b"b", value: b"" },
            LeafEntry { key: b"a", value: b"" },
        ];
        assert_eq!(
            LeafNode::new(entries).map(|_| ()),
            Err(NodeError::KeysOutOfOrder { index: 1 })
        );
    }

    #[test]
    fn test_overrun_is_truncated() {
        let mut page = leaf_page(&[("a", "1")]);
        page.write_u16(KEY_COUNT_OFFSET, 500);
        page.seal_checksum_at(PageHeader::CHECKSUM_OFFSET);

        assert!(matches!(
            Node::from_page(&page),
            Err(NodeError::Truncated { .. } | NodeError::KeysOutOfOrder { .. })
        ));
    }

    #[test]
    fn test_internal_node_validation() {
        assert!(matches!(
            InternalNode::new(vec![&b"a"[..]], vec![1]),
            Err(NodeError::ChildCountMismatch { .. })
        ));
        assert!(matches!(
            InternalNode::new(vec![&b"a"[..]], vec![1, NULL_BLOCK_ID]),
            Err(NodeError::NullChild { index: 1 })
        ));
    }

    #[test]
    fn test_oversized_leaf_does_not_fit() {
        let value = vec![0u8; MAX_VALUE_SIZE];
        let keys: Vec<String> = (0..10).map(|i| format!("key{i}")).collect();
        let entries = keys
            .iter()
            .map(|k| LeafEntry {
                key: k.as_bytes(),
                value: &value,
            })
            .collect();
        let leaf = LeafNode::new(entries).expect("valid entries");

        let mut page = Page::new();
        assert!(matches!(
            leaf.write_to_page(&mut page),
            Err(NodeError::NodeFull { .. })
        ));
    }
}
