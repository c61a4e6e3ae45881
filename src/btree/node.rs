//! # B+Tree Node Model
//!
//! This module implements the in-memory node of the paged B+tree. A node
//! is a sorted 64-bit key array plus, depending on its kind, a parallel
//! value array (leaves, and inner nodes of non-unique trees) or a child
//! page-id array with cached size hints (inner nodes).
//!
//! ## One Struct, Two Axes
//!
//! The original design had an abstract node with four concrete variants;
//! behavior only diverges along two axes, so a single struct carries both
//! tags:
//!
//! - **kind**: leaf vs inner, deciding which parallel arrays exist.
//! - **mode**: unique vs non-unique, deciding the comparator. Unique
//!   nodes order by key alone; non-unique nodes order by the
//!   `(key, value)` pair, and their inner nodes store separator values.
//!
//! ## Size Accounting
//!
//! `current_size` is the exact serialized footprint of the node:
//!
//! ```text
//! STORAGE_HEADER_SIZE
//!   + encoded key array (prefix metadata + packed suffixes; 0 if empty)
//!   + leaf:  num_keys * value_size
//!     inner: 4 * (num_keys + 1) child ids
//!            + num_keys * value_size     (non-unique only)
//! ```
//!
//! Every mutator recomputes the cached prefix and size; the fullness
//! predicates (`overflows`, `is_underfull`, `has_extra_keys`,
//! `fits_into_one_node_with`) read the cache. The underfull threshold is
//! `page_size * 3 / 4` and drives deletion-time rebalancing.
//!
//! ## Separator Convention
//!
//! The separator stored at position `i` of an inner node is the smallest
//! entry of the subtree at child `i + 1`. An exact match therefore
//! descends to the right of its separator.
//!
//! ## Dirty Discipline
//!
//! Every mutator sets the node's dirty flag. The buffer manager moves a
//! node into its dirty map before handing out a mutable borrow, so flag
//! and map stay in sync without nodes holding a manager back-reference.

use std::cmp::Ordering;

use eyre::Result;

use crate::config::{CHILD_ID_SIZE, STORAGE_HEADER_SIZE, UNDERFULL_DENOMINATOR, UNDERFULL_NUMERATOR};
use crate::error::IndexError;

use super::prefix;
use super::{PageId, TreeConfig, NO_PAGE};

/// Child size hint value meaning "not known"; hints are never persisted
/// and a freshly loaded node starts with all hints unknown.
pub const SIZE_UNKNOWN: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Inner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    NotFound(usize),
}

#[derive(Debug, Clone)]
pub struct BTreeNode {
    page_id: PageId,
    kind: NodeKind,
    root: bool,
    dirty: bool,
    cfg: TreeConfig,
    keys: Vec<i64>,
    values: Vec<i64>,
    child_ids: Vec<PageId>,
    child_sizes: Vec<u32>,
    prefix_bits: u8,
    prefix: u64,
    current_size: usize,
}

impl BTreeNode {
    pub fn new_leaf(cfg: TreeConfig, root: bool) -> Self {
        let mut node = Self {
            page_id: NO_PAGE,
            kind: NodeKind::Leaf,
            root,
            dirty: true,
            cfg,
            keys: Vec::new(),
            values: Vec::new(),
            child_ids: Vec::new(),
            child_sizes: Vec::new(),
            prefix_bits: 0,
            prefix: 0,
            current_size: 0,
        };
        node.recompute();
        node
    }

    pub fn new_inner(cfg: TreeConfig, root: bool) -> Self {
        let mut node = Self {
            page_id: NO_PAGE,
            kind: NodeKind::Inner,
            root,
            dirty: true,
            cfg,
            keys: Vec::new(),
            values: Vec::new(),
            child_ids: Vec::new(),
            child_sizes: Vec::new(),
            prefix_bits: 0,
            prefix: 0,
            current_size: 0,
        };
        node.recompute();
        node
    }

    /// Rebuilds a node from its decoded page image.
    pub(crate) fn from_parts(
        cfg: TreeConfig,
        page_id: PageId,
        kind: NodeKind,
        root: bool,
        keys: Vec<i64>,
        values: Vec<i64>,
        child_ids: Vec<PageId>,
    ) -> Self {
        let child_sizes = vec![SIZE_UNKNOWN; child_ids.len()];
        let mut node = Self {
            page_id,
            kind,
            root,
            dirty: false,
            cfg,
            keys,
            values,
            child_ids,
            child_sizes,
            prefix_bits: 0,
            prefix: 0,
            current_size: 0,
        };
        node.recompute();
        node
    }

    // --- identity and flags ---------------------------------------------

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub(crate) fn set_page_id(&mut self, id: PageId) {
        self.page_id = id;
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn set_root(&mut self, root: bool) {
        if self.root != root {
            self.root = root;
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn config(&self) -> TreeConfig {
        self.cfg
    }

    // --- entry access ---------------------------------------------------

    pub fn num_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn key_at(&self, index: usize) -> i64 {
        self.keys[index]
    }

    pub fn value_at(&self, index: usize) -> i64 {
        self.values[index]
    }

    pub fn keys(&self) -> &[i64] {
        &self.keys
    }

    pub fn values(&self) -> &[i64] {
        &self.values
    }

    pub fn smallest_key(&self) -> i64 {
        self.keys[0]
    }

    pub fn largest_key(&self) -> i64 {
        self.keys[self.keys.len() - 1]
    }

    pub fn child_id(&self, index: usize) -> PageId {
        self.child_ids[index]
    }

    pub fn child_ids(&self) -> &[PageId] {
        &self.child_ids
    }

    pub(crate) fn set_child_id(&mut self, index: usize, id: PageId) {
        if self.child_ids[index] != id {
            self.child_ids[index] = id;
            self.dirty = true;
        }
    }

    pub fn child_size_hint(&self, index: usize) -> u32 {
        self.child_sizes[index]
    }

    /// Records the serialized size of a referenced child. Hints are
    /// advisory: never persisted, allowed to go stale.
    pub fn set_child_size_hint(&mut self, index: usize, size: u32) {
        self.child_sizes[index] = size;
    }

    // --- ordering -------------------------------------------------------

    /// Compares the entry at `index` against the search key for the mode
    /// in use: unique trees compare keys alone, non-unique trees compare
    /// `(key, value)` pairs.
    fn entry_cmp(&self, index: usize, key: i64, value: i64) -> Ordering {
        if self.cfg.unique || self.values.is_empty() {
            self.keys[index].cmp(&key)
        } else {
            (self.keys[index], self.values[index]).cmp(&(key, value))
        }
    }

    pub fn binary_search(&self, key: i64, value: i64) -> SearchResult {
        let mut lo = 0usize;
        let mut hi = self.keys.len();

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.entry_cmp(mid, key, value) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return SearchResult::Found(mid),
            }
        }

        SearchResult::NotFound(lo)
    }

    /// Child slot to descend into for the search key. An exact separator
    /// match descends right (the separator is the smallest entry of its
    /// right subtree); a miss descends at the insertion point.
    pub fn child_index_for(&self, key: i64, value: i64) -> usize {
        match self.binary_search(key, value) {
            SearchResult::Found(i) => i + 1,
            SearchResult::NotFound(i) => i,
        }
    }

    // --- leaf mutation --------------------------------------------------

    /// Inserts or overwrites an entry in a leaf. The caller must have
    /// guaranteed room (proactive split); overflow here is a logic error.
    ///
    /// Returns `false` without touching the node when `only_if_absent` is
    /// set and the entry already exists.
    pub fn leaf_put(&mut self, key: i64, value: i64, only_if_absent: bool) -> Result<bool> {
        if !self.is_leaf() {
            return Err(IndexError::InvariantViolation("put called on an inner node").into());
        }

        match self.binary_search(key, value) {
            SearchResult::Found(i) => {
                if only_if_absent {
                    return Ok(false);
                }
                self.values[i] = value;
                self.dirty = true;
                self.recompute();
            }
            SearchResult::NotFound(i) => {
                self.keys.insert(i, key);
                self.values.insert(i, value);
                self.dirty = true;
                self.recompute();
                debug_assert!(
                    !self.overflows(),
                    "leaf overflowed: caller skipped the proactive split"
                );
            }
        }

        Ok(true)
    }

    /// Removes the entry matching `(key, value)` from a leaf and returns
    /// its value. Fails with [`IndexError::KeyNotFound`] when absent.
    pub fn leaf_delete(&mut self, key: i64, value: i64) -> Result<i64> {
        if !self.is_leaf() {
            return Err(IndexError::InvariantViolation("delete called on an inner node").into());
        }

        match self.binary_search(key, value) {
            SearchResult::Found(i) => {
                let old = self.values[i];
                self.keys.remove(i);
                self.values.remove(i);
                self.dirty = true;
                self.recompute();
                Ok(old)
            }
            SearchResult::NotFound(_) => Err(IndexError::KeyNotFound { key, value }.into()),
        }
    }

    // --- inner mutation -------------------------------------------------

    /// Installs a separator at `pos` with the freshly split right sibling
    /// at child slot `pos + 1`. The caller guarantees room.
    pub fn inner_put_separator(
        &mut self,
        pos: usize,
        key: i64,
        value: i64,
        right_child: PageId,
        right_size: u32,
    ) -> Result<()> {
        if self.is_leaf() {
            return Err(IndexError::InvariantViolation("separator put on a leaf node").into());
        }

        self.keys.insert(pos, key);
        if !self.cfg.unique {
            self.values.insert(pos, value);
        }
        self.child_ids.insert(pos + 1, right_child);
        self.child_sizes.insert(pos + 1, right_size);
        self.dirty = true;
        self.recompute();
        debug_assert!(
            !self.overflows(),
            "inner node overflowed: caller skipped the proactive split"
        );
        Ok(())
    }

    /// Populates an empty root after a root split: one separator, two
    /// children.
    pub fn init_root(
        &mut self,
        key: i64,
        value: i64,
        left: PageId,
        right: PageId,
        left_size: u32,
        right_size: u32,
    ) -> Result<()> {
        if self.is_leaf() || !self.keys.is_empty() || !self.root {
            return Err(
                IndexError::InvariantViolation("root init requires an empty inner root").into(),
            );
        }

        self.keys.push(key);
        if !self.cfg.unique {
            self.values.push(value);
        }
        self.child_ids.push(left);
        self.child_ids.push(right);
        self.child_sizes.push(left_size);
        self.child_sizes.push(right_size);
        self.dirty = true;
        self.recompute();
        Ok(())
    }

    pub fn separator(&self, index: usize) -> (i64, i64) {
        let value = if self.cfg.unique { 0 } else { self.values[index] };
        (self.keys[index], value)
    }

    pub fn set_separator(&mut self, index: usize, key: i64, value: i64) {
        self.keys[index] = key;
        if !self.cfg.unique {
            self.values[index] = value;
        }
        self.dirty = true;
        self.recompute();
    }

    /// Drops the separator at `index` together with the child to its
    /// right (used after that child was merged into its left sibling).
    pub fn remove_separator(&mut self, index: usize) {
        self.keys.remove(index);
        if !self.cfg.unique {
            self.values.remove(index);
        }
        self.child_ids.remove(index + 1);
        self.child_sizes.remove(index + 1);
        self.dirty = true;
        self.recompute();
    }

    // --- splitting ------------------------------------------------------

    /// Split position for this node: the number of keys the left half
    /// keeps.
    pub fn split_index(&self) -> Result<usize> {
        let (weight_key, weight_child) = self.split_weights();
        let k = prefix::compute_index_for_split_after_insert(
            &self.keys,
            STORAGE_HEADER_SIZE,
            weight_key,
            weight_child,
            self.cfg.page_size,
        )?;

        if self.is_leaf() {
            Ok(k)
        } else {
            // an inner split extracts keys[k]; both remainders need a key
            Ok(k.min(self.keys.len().saturating_sub(2)).max(1))
        }
    }

    fn split_weights(&self) -> (usize, usize) {
        match (self.is_leaf(), self.cfg.unique) {
            (true, _) => (self.cfg.value_size, 0),
            (false, true) => (0, CHILD_ID_SIZE),
            (false, false) => (self.cfg.value_size, CHILD_ID_SIZE),
        }
    }

    /// Splits this node at `keys_left`, returning the promoted separator
    /// and the new right sibling.
    ///
    /// Leaves keep B+tree semantics: the separator is a copy of the right
    /// sibling's first entry. Inner nodes follow the B-tree convention:
    /// the middle entry moves to the parent and stays in neither half.
    pub fn split_off(&mut self, keys_left: usize) -> Result<(i64, i64, BTreeNode)> {
        if keys_left == 0 || keys_left >= self.keys.len() {
            return Err(IndexError::InvariantViolation("split position out of range").into());
        }
        if !self.is_leaf() && keys_left + 1 >= self.keys.len() {
            // the extracted middle entry must leave a key on the right
            return Err(IndexError::InvariantViolation("inner split leaves an empty right half").into());
        }

        let (sep_key, sep_value, mut right) = if self.is_leaf() {
            let right_keys = self.keys.split_off(keys_left);
            let right_values = self.values.split_off(keys_left);
            let sep = (right_keys[0], right_values[0]);

            let mut right = BTreeNode::new_leaf(self.cfg, false);
            right.keys = right_keys;
            right.values = right_values;
            (sep.0, sep.1, right)
        } else {
            let mut right_keys = self.keys.split_off(keys_left);
            let sep_key = right_keys.remove(0);
            let (sep_value, right_values) = if self.cfg.unique {
                (0, Vec::new())
            } else {
                let mut right_values = self.values.split_off(keys_left);
                let v = right_values.remove(0);
                (v, right_values)
            };
            let right_children = self.child_ids.split_off(keys_left + 1);
            let right_sizes = self.child_sizes.split_off(keys_left + 1);

            let mut right = BTreeNode::new_inner(self.cfg, false);
            right.keys = right_keys;
            right.values = right_values;
            right.child_ids = right_children;
            right.child_sizes = right_sizes;
            (sep_key, sep_value, right)
        };

        right.dirty = true;
        right.recompute();
        self.dirty = true;
        self.recompute();

        Ok((sep_key, sep_value, right))
    }

    // --- merging and borrowing ------------------------------------------

    /// Absorbs the right sibling of a leaf; entries stay sorted because
    /// every right entry compares greater.
    pub fn merge_from_leaf(&mut self, mut right: BTreeNode) -> Result<()> {
        if !self.is_leaf() || !right.is_leaf() {
            return Err(IndexError::InvariantViolation("leaf merge on mismatched kinds").into());
        }

        self.keys.append(&mut right.keys);
        self.values.append(&mut right.values);
        self.dirty = true;
        self.recompute();
        Ok(())
    }

    /// Absorbs the right sibling of an inner node, pulling the parent
    /// separator down between the two key runs.
    pub fn merge_from_inner(
        &mut self,
        sep_key: i64,
        sep_value: i64,
        mut right: BTreeNode,
    ) -> Result<()> {
        if self.is_leaf() || right.is_leaf() {
            return Err(IndexError::InvariantViolation("inner merge on mismatched kinds").into());
        }

        self.keys.push(sep_key);
        if !self.cfg.unique {
            self.values.push(sep_value);
        }
        self.keys.append(&mut right.keys);
        if !self.cfg.unique {
            self.values.append(&mut right.values);
        }
        self.child_ids.append(&mut right.child_ids);
        self.child_sizes.append(&mut right.child_sizes);
        self.dirty = true;
        self.recompute();
        Ok(())
    }

    pub fn pop_last_entry(&mut self) -> (i64, i64) {
        let key = self.keys.pop().expect("pop from empty node");
        let value = self.values.pop().expect("pop from empty node");
        self.dirty = true;
        self.recompute();
        (key, value)
    }

    pub fn pop_first_entry(&mut self) -> (i64, i64) {
        let key = self.keys.remove(0);
        let value = self.values.remove(0);
        self.dirty = true;
        self.recompute();
        (key, value)
    }

    pub fn push_front_entry(&mut self, key: i64, value: i64) {
        self.keys.insert(0, key);
        self.values.insert(0, value);
        self.dirty = true;
        self.recompute();
    }

    pub fn push_back_entry(&mut self, key: i64, value: i64) {
        self.keys.push(key);
        self.values.push(value);
        self.dirty = true;
        self.recompute();
    }

    pub fn pop_last_key(&mut self) -> (i64, i64) {
        let key = self.keys.pop().expect("pop from empty node");
        let value = if self.cfg.unique {
            0
        } else {
            self.values.pop().expect("pop from empty node")
        };
        self.dirty = true;
        self.recompute();
        (key, value)
    }

    pub fn pop_first_key(&mut self) -> (i64, i64) {
        let key = self.keys.remove(0);
        let value = if self.cfg.unique { 0 } else { self.values.remove(0) };
        self.dirty = true;
        self.recompute();
        (key, value)
    }

    pub fn push_front_key(&mut self, key: i64, value: i64) {
        self.keys.insert(0, key);
        if !self.cfg.unique {
            self.values.insert(0, value);
        }
        self.dirty = true;
        self.recompute();
    }

    pub fn push_back_key(&mut self, key: i64, value: i64) {
        self.keys.push(key);
        if !self.cfg.unique {
            self.values.push(value);
        }
        self.dirty = true;
        self.recompute();
    }

    pub fn pop_last_child(&mut self) -> (PageId, u32) {
        let id = self.child_ids.pop().expect("pop from childless node");
        let size = self.child_sizes.pop().expect("pop from childless node");
        self.dirty = true;
        self.recompute();
        (id, size)
    }

    pub fn pop_first_child(&mut self) -> (PageId, u32) {
        let id = self.child_ids.remove(0);
        let size = self.child_sizes.remove(0);
        self.dirty = true;
        self.recompute();
        (id, size)
    }

    pub fn push_front_child(&mut self, id: PageId, size: u32) {
        self.child_ids.insert(0, id);
        self.child_sizes.insert(0, size);
        self.dirty = true;
        self.recompute();
    }

    pub fn push_back_child(&mut self, id: PageId, size: u32) {
        self.child_ids.push(id);
        self.child_sizes.push(size);
        self.dirty = true;
        self.recompute();
    }

    // --- size accounting ------------------------------------------------

    pub fn recompute(&mut self) {
        if self.keys.is_empty() {
            self.prefix_bits = 0;
            self.prefix = 0;
        } else {
            self.prefix_bits = prefix::prefix_bits(self.smallest_key(), self.largest_key());
            self.prefix = prefix::prefix_value(self.smallest_key(), self.prefix_bits);
        }
        self.current_size = self.compute_size();
    }

    pub fn compute_size(&self) -> usize {
        STORAGE_HEADER_SIZE + self.key_array_size() + self.non_key_size(self.keys.len())
    }

    pub fn key_array_size(&self) -> usize {
        if self.keys.is_empty() {
            0
        } else {
            prefix::encoded_array_size(self.keys.len(), self.prefix_bits)
        }
    }

    fn non_key_size(&self, num_keys: usize) -> usize {
        if self.is_leaf() {
            num_keys * self.cfg.value_size
        } else {
            let values = if self.cfg.unique {
                0
            } else {
                num_keys * self.cfg.value_size
            };
            CHILD_ID_SIZE * (num_keys + 1) + values
        }
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn prefix_bits(&self) -> u8 {
        self.prefix_bits
    }

    pub fn prefix(&self) -> u64 {
        self.prefix
    }

    pub fn page_size(&self) -> usize {
        self.cfg.page_size
    }

    pub fn page_size_threshold(&self) -> usize {
        self.cfg.page_size * UNDERFULL_NUMERATOR / UNDERFULL_DENOMINATOR
    }

    pub fn overflows(&self) -> bool {
        self.current_size > self.cfg.page_size
    }

    /// Serialized size after one more entry.
    ///
    /// For leaves the prediction is exact: the arriving entry is `key`
    /// itself, so the widened prefix span is known. An inner node
    /// receives a *separator* promoted from the child the key descends
    /// into, which can lie below every current key (a leftmost-child
    /// split), so the prediction assumes an empty prefix. The proactive
    /// split stays sound either way; inner nodes merely split a little
    /// earlier than perfect compression would allow.
    pub fn size_after_insert(&self, key: i64) -> usize {
        let num_keys = self.keys.len() + 1;
        let bits = if !self.is_leaf() {
            0
        } else if self.keys.is_empty() {
            64
        } else {
            let min = self.smallest_key().min(key);
            let max = self.largest_key().max(key);
            prefix::prefix_bits(min, max)
        };
        STORAGE_HEADER_SIZE + prefix::encoded_array_size(num_keys, bits) + self.non_key_size(num_keys)
    }

    pub fn would_overflow_after_insert(&self, key: i64) -> bool {
        self.size_after_insert(key) > self.cfg.page_size
    }

    pub fn is_underfull(&self) -> bool {
        if self.root {
            return self.keys.is_empty();
        }
        self.current_size < self.page_size_threshold()
    }

    /// Whether this node holds more than the rebalancing threshold asks
    /// for.
    pub fn has_extra_keys(&self) -> bool {
        if self.root {
            return true;
        }
        self.keys.len() > 2 && self.current_size > self.page_size_threshold()
    }

    /// Serialized size after donating the entry at one extremum
    /// (`from_end` = the largest entry, otherwise the smallest).
    pub fn size_after_donating(&self, from_end: bool) -> usize {
        let num_keys = self.keys.len().saturating_sub(1);
        if num_keys == 0 {
            return STORAGE_HEADER_SIZE + self.non_key_size(0);
        }
        let (min, max) = if from_end {
            (self.keys[0], self.keys[num_keys - 1])
        } else {
            (self.keys[1], self.keys[num_keys])
        };
        let bits = prefix::prefix_bits(min, max);
        STORAGE_HEADER_SIZE + prefix::encoded_array_size(num_keys, bits) + self.non_key_size(num_keys)
    }

    /// Whether this node can donate its extremum entry and still satisfy
    /// the rebalancing threshold afterwards. Donating from a node with
    /// one entry of slack would only move the hole next door.
    pub fn can_donate(&self, from_end: bool) -> bool {
        self.has_extra_keys() && self.size_after_donating(from_end) >= self.page_size_threshold()
    }

    /// Whether this node and its right sibling would fit a single page
    /// after a merge (for inner nodes, including the pulled-down parent
    /// separator).
    pub fn fits_into_one_node_with(&self, right: &BTreeNode) -> bool {
        let num_keys = self.keys.len() + right.keys.len() + if self.is_leaf() { 0 } else { 1 };
        if num_keys == 0 {
            return true;
        }

        let min = match self.keys.first().or_else(|| right.keys.first()) {
            Some(&k) => k,
            None => return true,
        };
        let max = match right.keys.last().or_else(|| self.keys.last()) {
            Some(&k) => k,
            None => return true,
        };

        let bits = prefix::prefix_bits(min, max);
        let merged = STORAGE_HEADER_SIZE
            + prefix::encoded_array_size(num_keys, bits)
            + self.non_key_size(num_keys);
        merged <= self.cfg.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_cfg(page_size: usize) -> TreeConfig {
        TreeConfig::new(page_size, true, 8).unwrap()
    }

    fn non_unique_cfg(page_size: usize) -> TreeConfig {
        TreeConfig::new(page_size, false, 8).unwrap()
    }

    fn leaf_with(cfg: TreeConfig, entries: &[(i64, i64)]) -> BTreeNode {
        let mut node = BTreeNode::new_leaf(cfg, false);
        for &(k, v) in entries {
            node.leaf_put(k, v, false).unwrap();
        }
        node
    }

    #[test]
    fn empty_leaf_size_is_header_only() {
        let node = BTreeNode::new_leaf(unique_cfg(4096), true);
        assert_eq!(node.current_size(), STORAGE_HEADER_SIZE);
    }

    #[test]
    fn leaf_put_keeps_keys_sorted() {
        let node = leaf_with(unique_cfg(4096), &[(5, 50), (2, 20), (8, 80), (1, 10)]);
        assert_eq!(node.keys(), &[1, 2, 5, 8]);
        assert_eq!(node.values(), &[10, 20, 50, 80]);
    }

    #[test]
    fn leaf_put_overwrites_in_unique_mode() {
        let mut node = leaf_with(unique_cfg(4096), &[(5, 50)]);
        assert!(node.leaf_put(5, 99, false).unwrap());
        assert_eq!(node.num_keys(), 1);
        assert_eq!(node.value_at(0), 99);
    }

    #[test]
    fn leaf_put_only_if_absent_refuses_duplicate() {
        let mut node = leaf_with(unique_cfg(4096), &[(5, 50)]);
        assert!(!node.leaf_put(5, 99, true).unwrap());
        assert_eq!(node.value_at(0), 50);
    }

    #[test]
    fn non_unique_leaf_orders_by_key_value_pair() {
        let node = leaf_with(non_unique_cfg(4096), &[(10, 3), (10, 1), (20, 1), (10, 2)]);
        assert_eq!(node.keys(), &[10, 10, 10, 20]);
        assert_eq!(node.values(), &[1, 2, 3, 1]);
    }

    #[test]
    fn non_unique_exact_pair_is_found() {
        let node = leaf_with(non_unique_cfg(4096), &[(10, 1), (10, 2)]);
        assert_eq!(node.binary_search(10, 2), SearchResult::Found(1));
        assert_eq!(node.binary_search(10, 5), SearchResult::NotFound(2));
    }

    #[test]
    fn leaf_delete_returns_old_value() {
        let mut node = leaf_with(unique_cfg(4096), &[(1, 10), (2, 20), (3, 30)]);
        assert_eq!(node.leaf_delete(2, 0).unwrap(), 20);
        assert_eq!(node.keys(), &[1, 3]);
    }

    #[test]
    fn leaf_delete_missing_key_fails() {
        let mut node = leaf_with(unique_cfg(4096), &[(1, 10)]);
        let err = node.leaf_delete(7, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::KeyNotFound { key: 7, .. })
        ));
    }

    #[test]
    fn put_on_inner_node_is_rejected() {
        let mut node = BTreeNode::new_inner(unique_cfg(4096), false);
        let err = node.leaf_put(1, 1, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::InvariantViolation(_))
        ));
    }

    #[test]
    fn child_index_descends_right_on_exact_separator() {
        let mut node = BTreeNode::new_inner(unique_cfg(4096), true);
        node.init_root(10, 0, -1, -2, 0, 0).unwrap();
        node.inner_put_separator(1, 20, 0, -3, 0).unwrap();

        assert_eq!(node.child_index_for(5, 0), 0);
        assert_eq!(node.child_index_for(10, 0), 1);
        assert_eq!(node.child_index_for(15, 0), 1);
        assert_eq!(node.child_index_for(20, 0), 2);
        assert_eq!(node.child_index_for(99, 0), 2);
    }

    #[test]
    fn size_tracks_prefix_compression() {
        // keys 1..=6 share 61 bits: 3 suffix bits each -> 3 payload bytes
        let node = leaf_with(
            unique_cfg(4096),
            &[(1, 1), (2, 2), (3, 3), (4, 4), (5, 5), (6, 6)],
        );
        let expected = STORAGE_HEADER_SIZE + (11 + 3) + 6 * 8;
        assert_eq!(node.current_size(), expected);
        assert_eq!(node.compute_size(), node.current_size());
    }

    #[test]
    fn size_after_insert_accounts_for_prefix_widening() {
        let node = leaf_with(unique_cfg(4096), &[(1, 1), (2, 2)]);
        // inserting a distant key forces full-width suffixes
        let widened = node.size_after_insert(i64::MIN);
        assert!(widened > node.current_size() + 8);
    }

    #[test]
    fn leaf_split_duplicates_first_right_entry() {
        let mut node = leaf_with(
            unique_cfg(4096),
            &[(1, 10), (2, 20), (3, 30), (4, 40), (5, 50), (6, 60)],
        );
        let (sep_key, sep_value, right) = node.split_off(3).unwrap();

        assert_eq!((sep_key, sep_value), (4, 40));
        assert_eq!(node.keys(), &[1, 2, 3]);
        assert_eq!(right.keys(), &[4, 5, 6]);
        assert_eq!(right.value_at(0), 40);
    }

    #[test]
    fn inner_split_extracts_middle_key() {
        let mut node = BTreeNode::new_inner(unique_cfg(4096), true);
        node.init_root(10, 0, -1, -2, 0, 0).unwrap();
        node.inner_put_separator(1, 20, 0, -3, 0).unwrap();
        node.inner_put_separator(2, 30, 0, -4, 0).unwrap();
        node.inner_put_separator(3, 40, 0, -5, 0).unwrap();

        let (sep_key, _, right) = node.split_off(2).unwrap();

        assert_eq!(sep_key, 30);
        assert_eq!(node.keys(), &[10, 20]);
        assert_eq!(node.child_ids(), &[-1, -2, -3]);
        assert_eq!(right.keys(), &[40]);
        assert_eq!(right.child_ids(), &[-4, -5]);
    }

    #[test]
    fn merge_from_leaf_concatenates() {
        let cfg = unique_cfg(4096);
        let mut left = leaf_with(cfg, &[(1, 10), (2, 20)]);
        let right = leaf_with(cfg, &[(5, 50), (6, 60)]);

        left.merge_from_leaf(right).unwrap();
        assert_eq!(left.keys(), &[1, 2, 5, 6]);
        assert_eq!(left.values(), &[10, 20, 50, 60]);
    }

    #[test]
    fn merge_from_inner_pulls_separator_down() {
        let cfg = unique_cfg(4096);
        let mut left = BTreeNode::new_inner(cfg, true);
        left.init_root(10, 0, -1, -2, 0, 0).unwrap();
        left.set_root(false);

        let mut right = BTreeNode::new_inner(cfg, true);
        right.init_root(40, 0, -3, -4, 0, 0).unwrap();
        right.set_root(false);

        left.merge_from_inner(25, 0, right).unwrap();
        assert_eq!(left.keys(), &[10, 25, 40]);
        assert_eq!(left.child_ids(), &[-1, -2, -3, -4]);
    }

    #[test]
    fn underfull_and_extra_keys_track_the_threshold() {
        let cfg = unique_cfg(128);
        // threshold is 96 bytes; each full-width entry is 16 bytes
        let mut node = leaf_with(cfg, &[(i64::MIN, 1), (i64::MAX, 2), (0, 3), (1, 4)]);
        node.set_root(false);
        assert_eq!(node.current_size(), STORAGE_HEADER_SIZE + 11 + 32 + 32);
        assert!(node.is_underfull());
        assert!(!node.has_extra_keys());

        node.leaf_put(2, 5, false).unwrap();
        assert_eq!(node.current_size(), 104);
        assert!(!node.is_underfull());
        assert!(node.has_extra_keys());
    }

    #[test]
    fn root_is_underfull_only_when_empty() {
        let mut node = BTreeNode::new_leaf(unique_cfg(4096), true);
        assert!(node.is_underfull());
        node.leaf_put(1, 1, false).unwrap();
        assert!(!node.is_underfull());
    }

    #[test]
    fn fits_into_one_node_with_respects_page_size() {
        let cfg = unique_cfg(128);
        let small_a = leaf_with(cfg, &[(1, 1), (2, 2)]);
        let small_b = leaf_with(cfg, &[(5, 5), (6, 6)]);
        assert!(small_a.fits_into_one_node_with(&small_b));

        let wide_a = leaf_with(cfg, &[(i64::MIN, 1), (0, 2), (1, 3), (2, 4)]);
        let wide_b = leaf_with(cfg, &[(3, 5), (4, 6), (i64::MAX, 7)]);
        assert!(!wide_a.fits_into_one_node_with(&wide_b));
    }
}
