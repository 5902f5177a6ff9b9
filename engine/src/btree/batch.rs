//! Batched access to one leaf's entries.

use crate::btree::keys::{Direction, KeyRange};
use crate::btree::node::{LeafIter, LeafNode};

/// A key-value pair borrowed from a locked leaf.
pub type Pair<'a> = (&'a [u8], &'a [u8]);

/// Pulls a leaf's in-range entries in groups.
///
/// The cursor borrows the leaf, which borrows its block lock, so batches
/// can only be taken while the leaf is locked.
#[derive(Debug, Clone)]
pub struct BatchCursor<'n, 'a> {
    entries: LeafIter<'n, 'a>,
}

impl<'n, 'a> BatchCursor<'n, 'a> {
    /// Position a cursor over the entries of `leaf` inside `range`.
    #[must_use]
    pub fn new(leaf: &'n LeafNode<'a>, range: &KeyRange, direction: Direction) -> Self {
        Self {
            entries: leaf.iterate(range, direction),
        }
    }

    /// Take up to `max_count` pairs in traversal order.
    ///
    /// Returns an empty batch once the cursor is exhausted.
    pub fn next_batch(&mut self, max_count: usize) -> Vec<Pair<'a>> {
        self.entries
            .by_ref()
            .take(max_count)
            .map(|entry| (entry.key, entry.value))
            .collect()
    }

    /// Pairs not yet taken.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.entries.len()
    }
}

impl<'a> Iterator for BatchCursor<'_, 'a> {
    type Item = Pair<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next().map(|entry| (entry.key, entry.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::{LeafEntry, Node};
    use crate::storage::Page;

    fn leaf_page(keys: &[&str]) -> Page {
        let entries = keys
            .iter()
            .map(|k| LeafEntry {
                key: k.as_bytes(),
                value: b"v",
            })
            .collect();
        let mut page = Page::new();
        LeafNode::new(entries)
            .expect("valid leaf")
            .write_to_page(&mut page)
            .expect("fits");
        page
    }

    #[test]
    fn test_batches_respect_max_count() {
        let page = leaf_page(&["a", "b", "c", "d", "e"]);
        let Node::Leaf(leaf) = Node::from_page(&page).expect("valid") else {
            panic!("expected leaf");
        };
        let mut cursor = BatchCursor::new(&leaf, &KeyRange::universe(), Direction::Forward);

        let first = cursor.next_batch(2);
        assert_eq!(first, vec![(&b"a"[..], &b"v"[..]), (&b"b"[..], &b"v"[..])]);
        assert_eq!(cursor.remaining(), 3);
        assert_eq!(cursor.next_batch(2).len(), 2);
        assert_eq!(cursor.next_batch(2).len(), 1);
        assert!(cursor.next_batch(2).is_empty());
    }

    #[test]
    fn test_backward_batches_descend() {
        let page = leaf_page(&["a", "b", "c", "d"]);
        let Node::Leaf(leaf) = Node::from_page(&page).expect("valid") else {
            panic!("expected leaf");
        };
        let range = KeyRange::half_open("b", "d").expect("valid");
        let mut cursor = BatchCursor::new(&leaf, &range, Direction::Backward);

        let keys: Vec<&[u8]> = cursor.next_batch(10).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![&b"c"[..], &b"b"[..]]);
    }

    #[test]
    fn test_zero_max_count_takes_nothing() {
        let page = leaf_page(&["a"]);
        let Node::Leaf(leaf) = Node::from_page(&page).expect("valid") else {
            panic!("expected leaf");
        };
        let mut cursor = BatchCursor::new(&leaf, &KeyRange::universe(), Direction::Forward);
        assert!(cursor.next_batch(0).is_empty());
        assert_eq!(cursor.remaining(), 1);
    }
}
