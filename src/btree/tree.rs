//! # B+Tree Algorithms
//!
//! This module implements the tree-level operations: search, insertion
//! with proactive splits, deletion with borrow/merge rebalancing, and
//! root management. The tree knows nothing about disk; it traverses
//! children by page id through the buffer manager.
//!
//! ## Proactive Split
//!
//! Insertion splits full nodes on the way *down*:
//!
//! ```text
//! 1. If the root would overflow after one more entry, split it and
//!    grow the tree by one level.
//! 2. While descending, before following a child pointer, split the
//!    child now if it would overflow, push the separator into the
//!    current node (guaranteed to have room) and re-pick the direction.
//! 3. The leaf reached this way always has room for the new entry.
//! ```
//!
//! No path ever recurses back up: the split index is chosen so both
//! halves fit the page even after one more entry.
//!
//! ## Deletion
//!
//! Deletion removes the entry first and repairs underfull nodes on the
//! recorded descent path afterwards, preferring the left sibling for
//! both borrowing and merging. Borrowed entries cross the boundary one
//! at a time (the donor's extremum adjacent to the receiver), updating
//! the parent separator each time; merges absorb the right node into the
//! left and drop the separator (leaves) or pull it down (inner nodes).
//! A root left with zero keys and a single child hands the root role to
//! that child.
//!
//! ## Descent Stacks
//!
//! Nodes hold no parent references. Each operation records its own
//! `(ancestor page id, child index)` stack on the way down and unwinds
//! it for rebalancing, so ownership stays single: every node belongs to
//! the buffer manager alone.
//!
//! ## Modification Counter
//!
//! Every successful external mutation advances `modification_count`.
//! Iterators stamp the counter (and the buffer manager's transaction id)
//! at construction and fail fast when either moves.

use std::sync::Arc;

use eyre::Result;
use smallvec::SmallVec;

use crate::error::IndexError;
use crate::session::IteratorRegistry;
use crate::storage::StorageChannel;

use super::buffer::BufferManager;
use super::iterator::LeafEntryIterator;
use super::node::{BTreeNode, SearchResult};
use super::{PageId, TreeConfig, NO_PAGE};

/// Descent stack entry: ancestor page id and the child slot taken.
pub(crate) type DescentStack = SmallVec<[(PageId, usize); 8]>;

pub struct BTree<C: StorageChannel> {
    buffer: BufferManager<C>,
    cfg: TreeConfig,
    root_id: PageId,
    committed_root: PageId,
    mod_count: u64,
    registry: Option<Arc<IteratorRegistry>>,
}

impl<C: StorageChannel> BTree<C> {
    /// Creates an empty tree on `channel`.
    pub fn create(channel: C, cfg: TreeConfig) -> Result<Self> {
        let mut buffer = BufferManager::new(channel, cfg)?;
        let root_id = buffer.save(BTreeNode::new_leaf(cfg, true));
        Ok(Self {
            buffer,
            cfg,
            root_id,
            committed_root: NO_PAGE,
            mod_count: 0,
            registry: None,
        })
    }

    /// Opens a tree whose root page id was persisted by the enclosing
    /// storage.
    pub fn open(channel: C, cfg: TreeConfig, root_page: PageId) -> Result<Self> {
        let mut buffer = BufferManager::new(channel, cfg)?;
        {
            let root = buffer.read(root_page)?;
            if !root.is_root() {
                return Err(IndexError::Corruption(format!(
                    "page {} is not a root node",
                    root_page
                ))
                .into());
            }
        }
        Ok(Self {
            buffer,
            cfg,
            root_id: root_page,
            committed_root: root_page,
            mod_count: 0,
            registry: None,
        })
    }

    pub fn config(&self) -> TreeConfig {
        self.cfg
    }

    /// Current root page id; after a commit this is the value the
    /// enclosing storage persists to locate the tree.
    pub fn root_page_id(&self) -> PageId {
        self.root_id
    }

    /// Monotonic counter advanced by every successful mutation.
    pub fn modification_count(&self) -> u64 {
        self.mod_count
    }

    pub fn buffer_manager(&self) -> &BufferManager<C> {
        &self.buffer
    }

    /// Drops clean nodes from the cache; see
    /// [`BufferManager::evict_clean_pages`].
    pub fn evict_clean_pages(&mut self) -> usize {
        self.buffer.evict_clean_pages()
    }

    /// Attaches the registry the enclosing session uses to close
    /// outstanding cursors on commit and rollback.
    pub fn attach_registry(&mut self, registry: Arc<IteratorRegistry>) {
        self.registry = Some(registry);
    }

    pub(crate) fn registry(&self) -> Option<&Arc<IteratorRegistry>> {
        self.registry.as_ref()
    }

    pub(crate) fn read_node(&mut self, page_id: PageId) -> Result<&BTreeNode> {
        self.buffer.read(page_id)
    }

    pub(crate) fn transaction_id(&self) -> u64 {
        self.buffer.transaction_id()
    }

    // --- queries --------------------------------------------------------

    /// Point lookup. In unique mode returns the value stored under
    /// `key`; in non-unique mode the value of the first entry with that
    /// key.
    pub fn search(&mut self, key: i64) -> Result<Option<i64>> {
        let mut current = self.root_id;
        loop {
            let node = self.buffer.read(current)?;
            if node.is_leaf() {
                let pos = match node.binary_search(key, i64::MIN) {
                    SearchResult::Found(i) => i,
                    SearchResult::NotFound(i) => i,
                };
                if pos < node.num_keys() && node.key_at(pos) == key {
                    return Ok(Some(node.value_at(pos)));
                }
                return Ok(None);
            }
            current = node.child_id(node.child_index_for(key, i64::MIN));
        }
    }

    /// Whether the tree contains `key` (unique mode) or the exact
    /// `(key, value)` pair (non-unique mode).
    pub fn contains(&mut self, key: i64, value: i64) -> Result<bool> {
        let mut current = self.root_id;
        loop {
            let node = self.buffer.read(current)?;
            if node.is_leaf() {
                return Ok(matches!(
                    node.binary_search(key, value),
                    SearchResult::Found(_)
                ));
            }
            current = node.child_id(node.child_index_for(key, value));
        }
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        let root_id = self.root_id;
        Ok(self.buffer.read(root_id)?.num_keys() == 0)
    }

    /// Number of levels from the root to the leaves; 1 for a leaf root.
    pub fn height(&mut self) -> Result<usize> {
        let mut levels = 1;
        let mut current = self.root_id;
        loop {
            let node = self.buffer.read(current)?;
            if node.is_leaf() {
                return Ok(levels);
            }
            current = node.child_id(0);
            levels += 1;
        }
    }

    // --- insertion ------------------------------------------------------

    /// Inserts an entry, overwriting the value of an existing key in
    /// unique mode.
    pub fn insert(&mut self, key: i64, value: i64) -> Result<()> {
        self.insert_entry(key, value, false)?;
        Ok(())
    }

    /// Inserts only when absent; returns `false` (leaving the tree
    /// untouched) when the key (unique mode) or exact pair (non-unique
    /// mode) already exists.
    pub fn insert_if_absent(&mut self, key: i64, value: i64) -> Result<bool> {
        if self.contains(key, value)? {
            return Ok(false);
        }
        self.insert_entry(key, value, true)
    }

    /// Inserts an entry that must not exist yet; fails with
    /// [`IndexError::DuplicateKey`] otherwise.
    pub fn insert_new(&mut self, key: i64, value: i64) -> Result<()> {
        if !self.insert_if_absent(key, value)? {
            return Err(IndexError::DuplicateKey { key }.into());
        }
        Ok(())
    }

    fn insert_entry(&mut self, key: i64, value: i64, only_if_absent: bool) -> Result<bool> {
        if self.buffer.read(self.root_id)?.would_overflow_after_insert(key) {
            self.split_root()?;
        }

        let mut current = self.root_id;
        loop {
            let step = {
                let node = self.buffer.read(current)?;
                if node.is_leaf() {
                    None
                } else {
                    let pos = node.child_index_for(key, value);
                    Some((pos, node.child_id(pos)))
                }
            };
            let Some((pos, child_id)) = step else { break };

            let child_full = self
                .buffer
                .read(child_id)?
                .would_overflow_after_insert(key);
            if child_full {
                self.split_child(current, pos, child_id)?;
                let node = self.buffer.read(current)?;
                let pos = node.child_index_for(key, value);
                current = node.child_id(pos);
            } else {
                current = child_id;
            }
        }

        let inserted = self.buffer.get_mut(current)?.leaf_put(key, value, only_if_absent)?;
        if inserted {
            self.mod_count += 1;
        }
        Ok(inserted)
    }

    /// Splits the child at `pos` of `parent_id`, pushing the separator
    /// up. The parent is guaranteed room by the proactive descent.
    fn split_child(&mut self, parent_id: PageId, pos: usize, child_id: PageId) -> Result<()> {
        let (sep_key, sep_value, right) = {
            let child = self.buffer.get_mut(child_id)?;
            let split_at = child.split_index()?;
            child.split_off(split_at)?
        };

        let left_size = self.buffer.read(child_id)?.current_size() as u32;
        let right_size = right.current_size() as u32;
        let right_id = self.buffer.save(right);

        let parent = self.buffer.get_mut(parent_id)?;
        parent.inner_put_separator(pos, sep_key, sep_value, right_id, right_size)?;
        parent.set_child_size_hint(pos, left_size);
        Ok(())
    }

    /// Splits a full root. The old root keeps its page and becomes the
    /// left child; a fresh inner root takes over with a single
    /// separator.
    fn split_root(&mut self) -> Result<()> {
        let old_root_id = self.root_id;

        let (sep_key, sep_value, right) = {
            let root = self.buffer.get_mut(old_root_id)?;
            root.set_root(false);
            let split_at = root.split_index()?;
            root.split_off(split_at)?
        };

        let left_size = self.buffer.read(old_root_id)?.current_size() as u32;
        let right_size = right.current_size() as u32;
        let right_id = self.buffer.save(right);

        let mut new_root = BTreeNode::new_inner(self.cfg, true);
        new_root.init_root(sep_key, sep_value, old_root_id, right_id, left_size, right_size)?;
        self.root_id = self.buffer.save(new_root);
        Ok(())
    }

    // --- deletion -------------------------------------------------------

    /// Removes the entry for `key` (unique mode) or the exact
    /// `(key, value)` pair (non-unique mode) and returns the removed
    /// value. Fails with [`IndexError::KeyNotFound`] when absent.
    pub fn remove(&mut self, key: i64, value: i64) -> Result<i64> {
        let mut stack = DescentStack::new();
        let mut current = self.root_id;
        loop {
            let node = self.buffer.read(current)?;
            if node.is_leaf() {
                break;
            }
            let pos = node.child_index_for(key, value);
            stack.push((current, pos));
            current = node.child_id(pos);
        }

        // probe before taking a mutable borrow: a failed remove must not
        // dirty the leaf
        let present = matches!(
            self.buffer.read(current)?.binary_search(key, value),
            SearchResult::Found(_)
        );
        if !present {
            return Err(IndexError::KeyNotFound { key, value }.into());
        }

        let old_value = self.buffer.get_mut(current)?.leaf_delete(key, value)?;
        self.mod_count += 1;

        self.rebalance_path(current, stack)?;
        Ok(old_value)
    }

    fn rebalance_path(&mut self, leaf_id: PageId, mut stack: DescentStack) -> Result<()> {
        let mut current = leaf_id;
        while let Some((parent_id, child_idx)) = stack.pop() {
            if !self.buffer.read(current)?.is_underfull() {
                break;
            }
            self.rebalance_child(parent_id, child_idx)?;
            current = parent_id;
        }

        // a drained inner root hands the tree to its only child
        let collapse = {
            let root = self.buffer.read(self.root_id)?;
            !root.is_leaf() && root.num_keys() == 0
        };
        if collapse {
            let child_id = self.buffer.read(self.root_id)?.child_id(0);
            self.buffer.delete(self.root_id);
            self.buffer.get_mut(child_id)?.set_root(true);
            self.root_id = child_id;
        }
        Ok(())
    }

    /// Repairs the underfull child at `child_idx`: borrow from the left
    /// sibling, then the right, then merge with whichever fits.
    fn rebalance_child(&mut self, parent_id: PageId, child_idx: usize) -> Result<()> {
        let (node_id, left_id, right_id) = {
            let parent = self.buffer.read(parent_id)?;
            let node_id = parent.child_id(child_idx);
            let left_id = (child_idx > 0).then(|| parent.child_id(child_idx - 1));
            let right_id =
                (child_idx < parent.num_keys()).then(|| parent.child_id(child_idx + 1));
            (node_id, left_id, right_id)
        };

        if let Some(left_id) = left_id {
            loop {
                if !self.buffer.read(node_id)?.is_underfull() {
                    break;
                }
                let donor_key = {
                    let donor = self.buffer.read(left_id)?;
                    if !donor.can_donate(true) {
                        break;
                    }
                    donor.largest_key()
                };
                // a distant borrowed key can widen the receiver's prefix
                // span; refuse the donation rather than overflow
                if self.buffer.read(node_id)?.would_overflow_after_insert(donor_key) {
                    break;
                }
                self.borrow_from_left(parent_id, child_idx, left_id, node_id)?;
            }
        }
        if let Some(right_id) = right_id {
            loop {
                if !self.buffer.read(node_id)?.is_underfull() {
                    break;
                }
                let donor_key = {
                    let donor = self.buffer.read(right_id)?;
                    if !donor.can_donate(false) {
                        break;
                    }
                    donor.smallest_key()
                };
                if self.buffer.read(node_id)?.would_overflow_after_insert(donor_key) {
                    break;
                }
                self.borrow_from_right(parent_id, child_idx, right_id, node_id)?;
            }
        }

        if !self.buffer.read(node_id)?.is_underfull() {
            return Ok(());
        }

        if let Some(left_id) = left_id {
            if self.merged_fits(left_id, node_id)? {
                return self.merge_into_left(parent_id, child_idx - 1, left_id, node_id);
            }
        }
        if let Some(right_id) = right_id {
            if self.merged_fits(node_id, right_id)? {
                return self.merge_into_left(parent_id, child_idx, node_id, right_id);
            }
        }

        // neither a donor nor a fitting merge exists; the node stays
        // underfull until a later mutation repairs it
        Ok(())
    }

    fn merged_fits(&mut self, left_id: PageId, right_id: PageId) -> Result<bool> {
        let right = self.buffer.read(right_id)?.clone();
        Ok(self.buffer.read(left_id)?.fits_into_one_node_with(&right))
    }

    fn borrow_from_left(
        &mut self,
        parent_id: PageId,
        child_idx: usize,
        left_id: PageId,
        node_id: PageId,
    ) -> Result<()> {
        let sep_idx = child_idx - 1;
        if self.buffer.read(node_id)?.is_leaf() {
            let (key, value) = self.buffer.get_mut(left_id)?.pop_last_entry();
            self.buffer.get_mut(node_id)?.push_front_entry(key, value);
            // the moved entry is the new smallest of the right subtree
            self.buffer.get_mut(parent_id)?.set_separator(sep_idx, key, value);
        } else {
            let (sep_key, sep_value) = self.buffer.read(parent_id)?.separator(sep_idx);
            let (donor_key, donor_value) = self.buffer.get_mut(left_id)?.pop_last_key();
            let (child, child_size) = self.buffer.get_mut(left_id)?.pop_last_child();
            let node = self.buffer.get_mut(node_id)?;
            node.push_front_key(sep_key, sep_value);
            node.push_front_child(child, child_size);
            self.buffer
                .get_mut(parent_id)?
                .set_separator(sep_idx, donor_key, donor_value);
        }
        self.refresh_child_hints(parent_id, child_idx, Some(sep_idx))
    }

    fn borrow_from_right(
        &mut self,
        parent_id: PageId,
        child_idx: usize,
        right_id: PageId,
        node_id: PageId,
    ) -> Result<()> {
        if self.buffer.read(node_id)?.is_leaf() {
            let (key, value) = self.buffer.get_mut(right_id)?.pop_first_entry();
            self.buffer.get_mut(node_id)?.push_back_entry(key, value);
            let (new_key, new_value) = {
                let right = self.buffer.read(right_id)?;
                (right.key_at(0), if right.values().is_empty() { 0 } else { right.value_at(0) })
            };
            self.buffer
                .get_mut(parent_id)?
                .set_separator(child_idx, new_key, new_value);
        } else {
            let (sep_key, sep_value) = self.buffer.read(parent_id)?.separator(child_idx);
            let (donor_key, donor_value) = self.buffer.get_mut(right_id)?.pop_first_key();
            let (child, child_size) = self.buffer.get_mut(right_id)?.pop_first_child();
            let node = self.buffer.get_mut(node_id)?;
            node.push_back_key(sep_key, sep_value);
            node.push_back_child(child, child_size);
            self.buffer
                .get_mut(parent_id)?
                .set_separator(child_idx, donor_key, donor_value);
        }
        self.refresh_child_hints(parent_id, child_idx, Some(child_idx + 1))
    }

    fn refresh_child_hints(
        &mut self,
        parent_id: PageId,
        child_idx: usize,
        sibling_idx: Option<usize>,
    ) -> Result<()> {
        let child_id = self.buffer.read(parent_id)?.child_id(child_idx);
        let child_size = self.buffer.read(child_id)?.current_size() as u32;
        self.buffer
            .get_mut(parent_id)?
            .set_child_size_hint(child_idx, child_size);

        if let Some(idx) = sibling_idx {
            let sibling_id = self.buffer.read(parent_id)?.child_id(idx);
            let sibling_size = self.buffer.read(sibling_id)?.current_size() as u32;
            self.buffer
                .get_mut(parent_id)?
                .set_child_size_hint(idx, sibling_size);
        }
        Ok(())
    }

    /// Merges the child at `sep_idx + 1` into the child at `sep_idx`'s
    /// left-hand side and drops the separator.
    fn merge_into_left(
        &mut self,
        parent_id: PageId,
        sep_idx: usize,
        left_id: PageId,
        right_id: PageId,
    ) -> Result<()> {
        let (sep_key, sep_value) = self.buffer.read(parent_id)?.separator(sep_idx);
        let right = self.buffer.take(right_id)?;

        let left = self.buffer.get_mut(left_id)?;
        if left.is_leaf() {
            left.merge_from_leaf(right)?;
        } else {
            left.merge_from_inner(sep_key, sep_value, right)?;
        }
        let left_size = left.current_size() as u32;

        let parent = self.buffer.get_mut(parent_id)?;
        parent.remove_separator(sep_idx);
        parent.set_child_size_hint(sep_idx, left_size);
        Ok(())
    }

    // --- iterators ------------------------------------------------------

    /// Ascending iterator over the whole tree.
    pub fn iterator(&mut self) -> Result<LeafEntryIterator> {
        LeafEntryIterator::ascending(self, i64::MIN, i64::MIN, i64::MAX)
    }

    /// Ascending iterator over keys in `[start, end]`.
    pub fn iterator_range(&mut self, start: i64, end: i64) -> Result<LeafEntryIterator> {
        LeafEntryIterator::ascending(self, start, i64::MIN, end)
    }

    /// Ascending iterator with an exact `(key, value)` lower bound
    /// (non-unique trees).
    pub fn iterator_from(&mut self, start_key: i64, start_value: i64) -> Result<LeafEntryIterator> {
        LeafEntryIterator::ascending(self, start_key, start_value, i64::MAX)
    }

    /// Descending iterator over the whole tree.
    pub fn descending_iterator(&mut self) -> Result<LeafEntryIterator> {
        LeafEntryIterator::descending(self, i64::MAX, i64::MIN)
    }

    /// Descending iterator from `start` down to `end` (`start >= end`).
    pub fn descending_iterator_range(
        &mut self,
        start: i64,
        end: i64,
    ) -> Result<LeafEntryIterator> {
        LeafEntryIterator::descending(self, start, end)
    }

    // --- transaction boundary -------------------------------------------

    /// Writes all dirty nodes (children before parents), closes
    /// registered cursors and returns the new root page id for the
    /// enclosing storage to persist.
    pub fn commit(&mut self) -> Result<PageId> {
        if let Some(registry) = &self.registry {
            registry.close_all();
        }
        let new_root = self.buffer.commit(self.root_id)?;
        self.root_id = new_root;
        self.committed_root = new_root;
        Ok(new_root)
    }

    /// Discards every uncommitted change and restores the last committed
    /// root (an empty tree if nothing was ever committed).
    pub fn rollback(&mut self) -> Result<()> {
        if let Some(registry) = &self.registry {
            registry.close_all();
        }
        self.buffer.clear();
        if self.committed_root != NO_PAGE {
            self.root_id = self.committed_root;
        } else {
            self.root_id = self.buffer.save(BTreeNode::new_leaf(self.cfg, true));
        }
        Ok(())
    }

    // --- structural validation ------------------------------------------

    /// Walks the whole tree checking structural invariants: entry
    /// ordering within and across nodes, separator placement, size
    /// accounting, byte budgets, child counts, root flags and uniform
    /// leaf depth. Intended for tests and debugging. Occupancy is not
    /// checked here: splits leave half-full siblings behind by design,
    /// and the deletion-time repair is exercised by dedicated tests.
    pub fn validate(&mut self) -> Result<()> {
        let root_id = self.root_id;
        {
            let root = self.buffer.read(root_id)?;
            if !root.is_root() {
                return Err(IndexError::InvariantViolation("root node lost its root flag").into());
            }
        }
        let mut leaf_depth = None;
        self.validate_subtree(root_id, 0, &mut leaf_depth)?;
        Ok(())
    }

    fn validate_subtree(
        &mut self,
        page_id: PageId,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> Result<((i64, i64), (i64, i64))> {
        let node = self.buffer.read(page_id)?.clone();
        let unique = self.cfg.unique;

        if node.current_size() != node.compute_size() {
            return Err(IndexError::InvariantViolation("cached size out of date").into());
        }
        if node.overflows() {
            return Err(IndexError::InvariantViolation("node exceeds its page budget").into());
        }
        if node.is_root() != (page_id == self.root_id) {
            return Err(IndexError::InvariantViolation("root flag on the wrong node").into());
        }

        let entry = |i: usize| -> (i64, i64) {
            let value = if node.values().is_empty() { 0 } else { node.value_at(i) };
            (node.key_at(i), value)
        };
        let ordered = move |a: (i64, i64), b: (i64, i64)| -> bool {
            if unique {
                a.0 < b.0
            } else {
                a < b
            }
        };

        for i in 1..node.num_keys() {
            if !ordered(entry(i - 1), entry(i)) {
                return Err(IndexError::InvariantViolation("entries out of order").into());
            }
        }

        if node.is_leaf() {
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    return Err(IndexError::InvariantViolation("leaves at unequal depths").into())
                }
                _ => {}
            }
            if node.num_keys() == 0 && !node.is_root() {
                return Err(IndexError::InvariantViolation("empty non-root leaf").into());
            }
            let min = if node.num_keys() == 0 { (0, 0) } else { entry(0) };
            let max = if node.num_keys() == 0 {
                (0, 0)
            } else {
                entry(node.num_keys() - 1)
            };
            return Ok((min, max));
        }

        if node.child_ids().len() != node.num_keys() + 1 {
            return Err(IndexError::InvariantViolation("child count mismatch").into());
        }
        if node.num_keys() == 0 {
            return Err(IndexError::InvariantViolation("inner node without separators").into());
        }

        let le = move |a: (i64, i64), b: (i64, i64)| -> bool {
            if unique {
                a.0 <= b.0
            } else {
                a <= b
            }
        };

        let mut subtree_min = None;
        let mut subtree_max = (0, 0);
        for i in 0..=node.num_keys() {
            let (child_min, child_max) =
                self.validate_subtree(node.child_id(i), depth + 1, leaf_depth)?;
            if i == 0 {
                subtree_min = Some(child_min);
            }
            subtree_max = child_max;

            if i > 0 {
                let sep = node.separator(i - 1);
                // separator is the smallest entry of its right subtree
                if !le(sep, child_min) {
                    return Err(
                        IndexError::InvariantViolation("separator above right subtree").into()
                    );
                }
            }
            if i < node.num_keys() {
                let sep = node.separator(i);
                if !le(child_max, sep) {
                    return Err(
                        IndexError::InvariantViolation("separator below left subtree").into()
                    );
                }
            }
        }

        Ok((subtree_min.unwrap_or((0, 0)), subtree_max))
    }
}
