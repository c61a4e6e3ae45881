//! # Leaf Entry Iterators
//!
//! Stateful cursors over the tree's leaf entries, ascending or
//! descending, optionally bounded by a key range or an exact
//! `(key, value)` lower bound.
//!
//! ## Snapshot Discipline
//!
//! An iterator captures the buffer manager's transaction id and the
//! tree's modification counter at construction and re-checks both on
//! every call:
//!
//! - transaction id moved (commit or rollback happened) →
//!   [`IndexError::IteratorInvalidatedByCommit`]
//! - modification counter moved (the tree mutated underneath) →
//!   [`IndexError::ConcurrentModification`]
//!
//! A cursor never returns stale data: it either observes the exact
//! snapshot it started on or fails.
//!
//! ## No Pinned Nodes
//!
//! The cursor state is page ids and positions only: the current leaf,
//! a position within it and a stack of `(ancestor id, child index)`
//! pairs. Between steps the buffer manager is free to evict the leaf; a
//! later step simply re-reads it by id, which stays valid as long as the
//! stamps do. The tree itself is passed into each call rather than
//! borrowed for the cursor's lifetime, so open cursors do not block
//! mutations, it detects them.

use eyre::Result;
use smallvec::SmallVec;

use crate::error::IndexError;
use crate::session::CursorHandle;
use crate::storage::StorageChannel;

use super::node::SearchResult;
use super::tree::BTree;
use super::{PageId, NO_PAGE};

/// One leaf entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub key: i64,
    pub value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Ascending,
    Descending,
}

pub struct LeafEntryIterator {
    direction: Direction,
    lo_key: i64,
    lo_value: i64,
    hi_key: i64,
    cur_leaf: PageId,
    cur_pos: usize,
    ancestors: SmallVec<[(PageId, usize); 8]>,
    exhausted: bool,
    tx_id: u64,
    mod_count: u64,
    cursor: Option<CursorHandle>,
}

impl LeafEntryIterator {
    pub(crate) fn ascending<C: StorageChannel>(
        tree: &mut BTree<C>,
        lo_key: i64,
        lo_value: i64,
        hi_key: i64,
    ) -> Result<Self> {
        let mut iter = Self::stamped(tree, Direction::Ascending, lo_key, lo_value, hi_key);
        iter.position_ascending(tree)?;
        Ok(iter)
    }

    pub(crate) fn descending<C: StorageChannel>(
        tree: &mut BTree<C>,
        hi_key: i64,
        lo_key: i64,
    ) -> Result<Self> {
        let mut iter = Self::stamped(tree, Direction::Descending, lo_key, i64::MIN, hi_key);
        iter.position_descending(tree)?;
        Ok(iter)
    }

    fn stamped<C: StorageChannel>(
        tree: &mut BTree<C>,
        direction: Direction,
        lo_key: i64,
        lo_value: i64,
        hi_key: i64,
    ) -> Self {
        Self {
            direction,
            lo_key,
            lo_value,
            hi_key,
            cur_leaf: NO_PAGE,
            cur_pos: 0,
            ancestors: SmallVec::new(),
            exhausted: false,
            tx_id: tree.transaction_id(),
            mod_count: tree.modification_count(),
            cursor: tree.registry().map(|registry| registry.register()),
        }
    }

    /// Whether another entry is available. Fails like `next` when the
    /// snapshot is gone.
    pub fn has_next<C: StorageChannel>(&self, tree: &BTree<C>) -> Result<bool> {
        self.check_validity(tree)?;
        Ok(!self.exhausted)
    }

    /// Emits the current entry and advances. `Ok(None)` once the range
    /// is exhausted.
    pub fn next<C: StorageChannel>(&mut self, tree: &mut BTree<C>) -> Result<Option<Entry>> {
        self.check_validity(tree)?;
        if self.exhausted || self.cur_leaf == NO_PAGE {
            return Ok(None);
        }

        let (entry, leaf_len) = {
            let leaf = tree.read_node(self.cur_leaf)?;
            (
                Entry {
                    key: leaf.key_at(self.cur_pos),
                    value: leaf.value_at(self.cur_pos),
                },
                leaf.num_keys(),
            )
        };

        match self.direction {
            Direction::Ascending => {
                if self.cur_pos + 1 < leaf_len {
                    self.cur_pos += 1;
                } else {
                    self.advance_to_next_leaf(tree)?;
                }
                if !self.exhausted {
                    let key = tree.read_node(self.cur_leaf)?.key_at(self.cur_pos);
                    if key > self.hi_key {
                        self.exhausted = true;
                    }
                }
            }
            Direction::Descending => {
                if self.cur_pos > 0 {
                    self.cur_pos -= 1;
                } else {
                    self.retreat_to_prev_leaf(tree)?;
                }
                if !self.exhausted {
                    let key = tree.read_node(self.cur_leaf)?.key_at(self.cur_pos);
                    if key < self.lo_key {
                        self.exhausted = true;
                    }
                }
            }
        }

        Ok(Some(entry))
    }

    /// Releases the cursor: drops the leaf reference and deregisters
    /// from the session registry. Safe to call more than once.
    pub fn close(&mut self) {
        self.cursor.take();
        self.cur_leaf = NO_PAGE;
        self.exhausted = true;
    }

    fn check_validity<C: StorageChannel>(&self, tree: &BTree<C>) -> Result<()> {
        let current_tx = tree.transaction_id();
        if self.tx_id != current_tx {
            return Err(IndexError::IteratorInvalidatedByCommit {
                iterator_tx: self.tx_id,
                current_tx,
            }
            .into());
        }
        let current_mod = tree.modification_count();
        if self.mod_count != current_mod {
            return Err(IndexError::ConcurrentModification {
                iterator_mod: self.mod_count,
                current_mod,
            }
            .into());
        }
        if let Some(cursor) = &self.cursor {
            if cursor.is_closed() {
                return Err(IndexError::IteratorInvalidatedByCommit {
                    iterator_tx: self.tx_id,
                    current_tx,
                }
                .into());
            }
        }
        Ok(())
    }

    fn position_ascending<C: StorageChannel>(&mut self, tree: &mut BTree<C>) -> Result<()> {
        let mut current = tree.root_page_id();
        loop {
            let node = tree.read_node(current)?;
            if node.is_leaf() {
                break;
            }
            let pos = node.child_index_for(self.lo_key, self.lo_value);
            self.ancestors.push((current, pos));
            current = node.child_id(pos);
        }
        self.cur_leaf = current;

        let (pos, leaf_len) = {
            let leaf = tree.read_node(current)?;
            let pos = match leaf.binary_search(self.lo_key, self.lo_value) {
                SearchResult::Found(i) => i,
                SearchResult::NotFound(i) => i,
            };
            (pos, leaf.num_keys())
        };
        self.cur_pos = pos;
        if pos >= leaf_len {
            self.advance_to_next_leaf(tree)?;
        }

        if !self.exhausted {
            let key = tree.read_node(self.cur_leaf)?.key_at(self.cur_pos);
            if key > self.hi_key {
                self.exhausted = true;
            }
        }
        Ok(())
    }

    fn position_descending<C: StorageChannel>(&mut self, tree: &mut BTree<C>) -> Result<()> {
        let mut current = tree.root_page_id();
        loop {
            let node = tree.read_node(current)?;
            if node.is_leaf() {
                break;
            }
            let pos = node.child_index_for(self.hi_key, i64::MAX);
            self.ancestors.push((current, pos));
            current = node.child_id(pos);
        }
        self.cur_leaf = current;

        let start = {
            let leaf = tree.read_node(current)?;
            match leaf.binary_search(self.hi_key, i64::MAX) {
                SearchResult::Found(i) => Some(i),
                SearchResult::NotFound(0) => None,
                SearchResult::NotFound(i) => Some(i - 1),
            }
        };
        match start {
            Some(pos) => self.cur_pos = pos,
            None => self.retreat_to_prev_leaf(tree)?,
        }

        if !self.exhausted {
            let key = tree.read_node(self.cur_leaf)?.key_at(self.cur_pos);
            if key < self.lo_key {
                self.exhausted = true;
            }
        }
        Ok(())
    }

    /// Pops ancestors until one has a further child, then descends to
    /// the leftmost leaf under it.
    fn advance_to_next_leaf<C: StorageChannel>(&mut self, tree: &mut BTree<C>) -> Result<()> {
        loop {
            let Some((node_id, pos)) = self.ancestors.pop() else {
                self.exhausted = true;
                return Ok(());
            };
            let next_child = {
                let node = tree.read_node(node_id)?;
                (pos + 1 <= node.num_keys()).then(|| node.child_id(pos + 1))
            };
            let Some(mut current) = next_child else {
                continue;
            };
            self.ancestors.push((node_id, pos + 1));

            loop {
                let node = tree.read_node(current)?;
                if node.is_leaf() {
                    self.cur_leaf = current;
                    self.cur_pos = 0;
                    return Ok(());
                }
                self.ancestors.push((current, 0));
                current = node.child_id(0);
            }
        }
    }

    /// Pops ancestors until one has an earlier child, then descends to
    /// the rightmost leaf under it.
    fn retreat_to_prev_leaf<C: StorageChannel>(&mut self, tree: &mut BTree<C>) -> Result<()> {
        loop {
            let Some((node_id, pos)) = self.ancestors.pop() else {
                self.exhausted = true;
                return Ok(());
            };
            if pos == 0 {
                continue;
            }
            self.ancestors.push((node_id, pos - 1));
            let mut current = tree.read_node(node_id)?.child_id(pos - 1);

            loop {
                let (is_leaf, last) = {
                    let node = tree.read_node(current)?;
                    (node.is_leaf(), node.num_keys())
                };
                if is_leaf {
                    self.cur_leaf = current;
                    self.cur_pos = last - 1;
                    return Ok(());
                }
                self.ancestors.push((current, last));
                current = tree.read_node(current)?.child_id(last);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::TreeConfig;
    use crate::session::IteratorRegistry;
    use crate::storage::FileChannel;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn create_tree(page_size: usize, unique: bool) -> (tempfile::TempDir, BTree<FileChannel>) {
        let dir = tempdir().unwrap();
        let cfg = TreeConfig::new(page_size, unique, 8).unwrap();
        let channel = FileChannel::create(dir.path().join("index.pag"), page_size).unwrap();
        (dir, BTree::create(channel, cfg).unwrap())
    }

    fn drain(iter: &mut LeafEntryIterator, tree: &mut BTree<FileChannel>) -> Vec<(i64, i64)> {
        let mut entries = Vec::new();
        while let Some(entry) = iter.next(tree).unwrap() {
            entries.push((entry.key, entry.value));
        }
        entries
    }

    #[test]
    fn empty_tree_yields_nothing() {
        let (_dir, mut tree) = create_tree(4096, true);

        let mut iter = tree.iterator().unwrap();
        assert!(!iter.has_next(&tree).unwrap());
        assert_eq!(iter.next(&mut tree).unwrap(), None);

        let mut desc = tree.descending_iterator().unwrap();
        assert_eq!(desc.next(&mut tree).unwrap(), None);
    }

    #[test]
    fn ascending_covers_all_leaves_in_order() {
        let (_dir, mut tree) = create_tree(128, true);
        for key in 0..120 {
            tree.insert(key, key * 3).unwrap();
        }

        let mut iter = tree.iterator().unwrap();
        let entries = drain(&mut iter, &mut tree);
        assert_eq!(entries.len(), 120);
        for (i, &(key, value)) in entries.iter().enumerate() {
            assert_eq!(key, i as i64);
            assert_eq!(value, key * 3);
        }
    }

    #[test]
    fn descending_is_the_exact_reverse() {
        let (_dir, mut tree) = create_tree(128, true);
        for key in 0..120 {
            tree.insert(key, key).unwrap();
        }

        let mut asc = tree.iterator().unwrap();
        let mut forward = drain(&mut asc, &mut tree);

        let mut desc = tree.descending_iterator().unwrap();
        let backward = drain(&mut desc, &mut tree);

        forward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let (_dir, mut tree) = create_tree(128, true);
        for key in 1..=40 {
            tree.insert(key, key).unwrap();
        }

        let mut iter = tree.iterator_range(10, 20).unwrap();
        let keys: Vec<i64> = drain(&mut iter, &mut tree).iter().map(|e| e.0).collect();
        assert_eq!(keys, (10..=20).collect::<Vec<_>>());

        let mut desc = tree.descending_iterator_range(20, 10).unwrap();
        let keys: Vec<i64> = drain(&mut desc, &mut tree).iter().map(|e| e.0).collect();
        assert_eq!(keys, (10..=20).rev().collect::<Vec<_>>());
    }

    #[test]
    fn range_bounds_between_keys() {
        let (_dir, mut tree) = create_tree(4096, true);
        for key in [2, 4, 6, 8, 10] {
            tree.insert(key, key).unwrap();
        }

        let mut iter = tree.iterator_range(3, 9).unwrap();
        let keys: Vec<i64> = drain(&mut iter, &mut tree).iter().map(|e| e.0).collect();
        assert_eq!(keys, vec![4, 6, 8]);
    }

    #[test]
    fn empty_range_yields_nothing() {
        let (_dir, mut tree) = create_tree(4096, true);
        for key in 1..=10 {
            tree.insert(key, key).unwrap();
        }

        let mut iter = tree.iterator_range(7, 6).unwrap();
        assert!(!iter.has_next(&tree).unwrap());
        assert_eq!(iter.next(&mut tree).unwrap(), None);
    }

    #[test]
    fn pair_lower_bound_in_non_unique_mode() {
        let (_dir, mut tree) = create_tree(4096, false);
        for (key, value) in [(10, 1), (10, 2), (10, 3), (20, 1)] {
            tree.insert(key, value).unwrap();
        }

        let mut iter = tree.iterator_from(10, 2).unwrap();
        let entries = drain(&mut iter, &mut tree);
        assert_eq!(entries, vec![(10, 2), (10, 3), (20, 1)]);
    }

    #[test]
    fn mutation_invalidates_open_iterators() {
        let (_dir, mut tree) = create_tree(4096, true);
        for key in 1..=10 {
            tree.insert(key, key).unwrap();
        }

        let mut iter = tree.iterator().unwrap();
        assert!(iter.next(&mut tree).unwrap().is_some());

        tree.insert(99, 99).unwrap();

        let err = iter.next(&mut tree).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::ConcurrentModification { .. })
        ));
        assert!(iter.has_next(&tree).is_err());
    }

    #[test]
    fn removal_invalidates_open_iterators() {
        let (_dir, mut tree) = create_tree(4096, true);
        for key in 1..=10 {
            tree.insert(key, key).unwrap();
        }

        let mut iter = tree.iterator().unwrap();
        tree.remove(5, 0).unwrap();

        assert!(matches!(
            iter.next(&mut tree).unwrap_err().downcast_ref::<IndexError>(),
            Some(IndexError::ConcurrentModification { .. })
        ));
    }

    #[test]
    fn commit_invalidates_open_iterators() {
        let (_dir, mut tree) = create_tree(4096, true);
        for key in 1..=10 {
            tree.insert(key, key).unwrap();
        }

        let mut iter = tree.iterator().unwrap();
        assert!(iter.next(&mut tree).unwrap().is_some());

        tree.commit().unwrap();

        let err = iter.next(&mut tree).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::IteratorInvalidatedByCommit { .. })
        ));
    }

    #[test]
    fn rollback_invalidates_open_iterators() {
        let (_dir, mut tree) = create_tree(4096, true);
        tree.insert(1, 1).unwrap();
        tree.commit().unwrap();

        let mut iter = tree.iterator().unwrap();
        tree.rollback().unwrap();

        assert!(matches!(
            iter.next(&mut tree).unwrap_err().downcast_ref::<IndexError>(),
            Some(IndexError::IteratorInvalidatedByCommit { .. })
        ));
    }

    #[test]
    fn registry_close_invalidates_before_any_stamp_moves() {
        let (_dir, mut tree) = create_tree(4096, true);
        let registry = IteratorRegistry::new();
        tree.attach_registry(Arc::clone(&registry));
        tree.insert(1, 1).unwrap();

        let iter = tree.iterator().unwrap();
        assert_eq!(registry.open_cursors(), 1);

        registry.close_all();
        let err = iter.has_next(&tree).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::IteratorInvalidatedByCommit { .. })
        ));
    }

    #[test]
    fn close_is_idempotent_and_deregisters() {
        let (_dir, mut tree) = create_tree(4096, true);
        let registry = IteratorRegistry::new();
        tree.attach_registry(Arc::clone(&registry));
        tree.insert(1, 1).unwrap();

        let mut iter = tree.iterator().unwrap();
        assert_eq!(registry.open_cursors(), 1);

        iter.close();
        iter.close();
        assert_eq!(registry.open_cursors(), 0);
        assert_eq!(iter.next(&mut tree).unwrap(), None);
    }

    #[test]
    fn iteration_survives_eviction_of_clean_leaves() {
        let (_dir, mut tree) = create_tree(128, true);
        for key in 0..80 {
            tree.insert(key, key).unwrap();
        }
        tree.commit().unwrap();

        let mut iter = tree.iterator().unwrap();
        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(iter.next(&mut tree).unwrap().unwrap().key);
        }
        // dropping clean nodes must not disturb the cursor: it re-reads
        // its leaf by id
        tree.evict_clean_pages();
        while let Some(entry) = iter.next(&mut tree).unwrap() {
            seen.push(entry.key);
        }
        assert_eq!(seen, (0..80).collect::<Vec<_>>());
    }
}
