//! # Buffer Manager
//!
//! The buffer manager owns every loaded node and is the only path to
//! cached tree state. It maps page ids to nodes, hands out buffer-local
//! ids for freshly created nodes, materializes pages lazily from the
//! storage channel, and writes dirty nodes back copy-on-write.
//!
//! ## Clean and Dirty Maps
//!
//! Cached nodes live in one of two maps:
//!
//! ```text
//! dirty: PageId -> BTreeNode    modified since the last write
//! clean: PageId -> BTreeNode    byte-identical to their on-disk page
//! ```
//!
//! `get_mut` moves a node into the dirty map before handing out the
//! mutable borrow, so the dirty set can never miss a modification. New
//! nodes enter through `save`, which assigns the next buffer-local
//! (negative) id. Only clean nodes are evictable; a dirty node's only
//! copy is the in-memory one.
//!
//! ## Copy-on-Write Commit
//!
//! `write` serializes a node into a freshly allocated channel page,
//! returns the old page to the free list, and re-keys the node under its
//! new id. Because ids change on write, `commit` walks the tree bottom-up
//! through the cached nodes: children are written first and their new
//! ids patched into the parent (dirtying it) before the parent itself is
//! written. The walk returns the root's final page id, the single value
//! the enclosing storage persists.
//!
//! ## Transaction Id
//!
//! The manager carries a monotonically increasing transaction id.
//! `commit` and `clear` (rollback) both advance it; iterators stamp the
//! id at construction and refuse to continue once it moves.

use eyre::Result;
use hashbrown::HashMap;

use crate::error::IndexError;
use crate::storage::StorageChannel;

use super::node::BTreeNode;
use super::{page, PageId, TreeConfig};

pub struct BufferManager<C: StorageChannel> {
    channel: C,
    cfg: TreeConfig,
    dirty: HashMap<PageId, BTreeNode>,
    clean: HashMap<PageId, BTreeNode>,
    /// Pages superseded in this transaction; released to the channel's
    /// free list only at commit, so a rollback still finds the committed
    /// snapshot intact.
    pending_free: Vec<u32>,
    next_buffer_id: PageId,
    tx_id: u64,
}

impl<C: StorageChannel> BufferManager<C> {
    pub fn new(channel: C, cfg: TreeConfig) -> Result<Self> {
        if channel.page_size() != cfg.page_size {
            return Err(IndexError::InvariantViolation(
                "channel page size does not match tree configuration",
            )
            .into());
        }
        Ok(Self {
            channel,
            cfg,
            dirty: HashMap::new(),
            clean: HashMap::new(),
            pending_free: Vec::new(),
            next_buffer_id: -1,
            tx_id: 1,
        })
    }

    pub fn config(&self) -> TreeConfig {
        self.cfg
    }

    /// Monotonic transaction id; advanced by `commit` and `clear`.
    pub fn transaction_id(&self) -> u64 {
        self.tx_id
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn dirty_node_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn cached_node_count(&self) -> usize {
        self.dirty.len() + self.clean.len()
    }

    /// Registers a freshly created node, assigning it a buffer-local id.
    pub fn save(&mut self, mut node: BTreeNode) -> PageId {
        let id = self.next_buffer_id;
        self.next_buffer_id -= 1;
        node.set_page_id(id);
        node.mark_dirty();
        self.dirty.insert(id, node);
        id
    }

    /// Returns the node for `page_id`, reading it from the storage
    /// channel on a cache miss. An id that is neither cached nor a
    /// channel page is corruption: the caller holds a handle from a
    /// previous life of the tree.
    pub fn read(&mut self, page_id: PageId) -> Result<&BTreeNode> {
        if self.dirty.contains_key(&page_id) {
            return Ok(&self.dirty[&page_id]);
        }
        if !self.clean.contains_key(&page_id) {
            let node = self.materialize(page_id)?;
            self.clean.insert(page_id, node);
        }
        Ok(&self.clean[&page_id])
    }

    /// Mutable access; moves the node into the dirty map first.
    pub fn get_mut(&mut self, page_id: PageId) -> Result<&mut BTreeNode> {
        if !self.dirty.contains_key(&page_id) {
            if !self.clean.contains_key(&page_id) {
                let node = self.materialize(page_id)?;
                self.clean.insert(page_id, node);
            }
            let mut node = match self.clean.remove(&page_id) {
                Some(node) => node,
                None => {
                    return Err(IndexError::Corruption(format!(
                        "page {} vanished from the clean map",
                        page_id
                    ))
                    .into())
                }
            };
            node.mark_dirty();
            self.dirty.insert(page_id, node);
        }
        match self.dirty.get_mut(&page_id) {
            Some(node) => Ok(node),
            None => Err(IndexError::Corruption(format!(
                "page {} vanished from the dirty map",
                page_id
            ))
            .into()),
        }
    }

    fn materialize(&mut self, page_id: PageId) -> Result<BTreeNode> {
        if page_id <= 0 {
            return Err(IndexError::Corruption(format!(
                "unknown page id {} (not cached, not on disk)",
                page_id
            ))
            .into());
        }
        let bytes = self.channel.read_page(page_id as u32)?;
        page::deserialize_node(bytes, self.cfg, page_id)
    }

    /// Removes a node from the cache and returns it, releasing its
    /// channel page to the free list.
    pub fn take(&mut self, page_id: PageId) -> Result<BTreeNode> {
        self.read(page_id)?;
        let node = self
            .dirty
            .remove(&page_id)
            .or_else(|| self.clean.remove(&page_id));
        let node = match node {
            Some(node) => node,
            None => {
                return Err(IndexError::Corruption(format!(
                    "page {} vanished during take",
                    page_id
                ))
                .into())
            }
        };
        if page_id > 0 {
            self.pending_free.push(page_id as u32);
        }
        Ok(node)
    }

    /// Drops a node; its channel page is released at the next commit.
    pub fn delete(&mut self, page_id: PageId) {
        self.dirty.remove(&page_id);
        self.clean.remove(&page_id);
        if page_id > 0 {
            self.pending_free.push(page_id as u32);
        }
    }

    /// Writes one node copy-on-write and returns its new page id. A node
    /// that is not dirty keeps its id and is not rewritten.
    pub fn write(&mut self, page_id: PageId) -> Result<PageId> {
        let mut node = match self.dirty.remove(&page_id) {
            Some(node) => node,
            None => return Ok(page_id),
        };

        let bytes = match page::serialize_node(&node) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.dirty.insert(page_id, node);
                return Err(err);
            }
        };

        let new_page = self.channel.allocate_page()?;
        self.channel.write_page(new_page, &bytes)?;
        if page_id > 0 {
            self.pending_free.push(page_id as u32);
        }

        let new_id = new_page as PageId;
        node.set_page_id(new_id);
        node.clear_dirty();
        self.clean.insert(new_id, node);
        Ok(new_id)
    }

    /// Writes every dirty node reachable from `root_id`, children before
    /// parents, patching renamed child ids into parents along the way.
    /// Returns the root's final page id and advances the transaction id.
    pub fn commit(&mut self, root_id: PageId) -> Result<PageId> {
        let new_root = self.write_subtree(root_id)?;
        self.channel.sync()?;
        for page_no in self.pending_free.drain(..) {
            self.channel.free_page(page_no);
        }
        self.tx_id += 1;
        Ok(new_root)
    }

    fn write_subtree(&mut self, page_id: PageId) -> Result<PageId> {
        // a node that was never cached has no dirty descendants: every
        // mutation loads its whole descent path
        let child_ids = match self.cached(page_id) {
            None => return Ok(page_id),
            Some(node) if node.is_leaf() => None,
            Some(node) => Some(node.child_ids().to_vec()),
        };

        if let Some(children) = child_ids {
            for (slot, child_id) in children.into_iter().enumerate() {
                let new_child_id = self.write_subtree(child_id)?;
                if new_child_id != child_id {
                    self.get_mut(page_id)?.set_child_id(slot, new_child_id);
                }
            }
        }

        self.write(page_id)
    }

    fn cached(&self, page_id: PageId) -> Option<&BTreeNode> {
        self.dirty.get(&page_id).or_else(|| self.clean.get(&page_id))
    }

    /// Forgets all cached nodes and dirty state (rollback) and advances
    /// the transaction id.
    pub fn clear(&mut self) {
        self.dirty.clear();
        self.clean.clear();
        // superseded pages stay allocated: the committed snapshot still
        // references them
        self.pending_free.clear();
        self.tx_id += 1;
    }

    /// Drops clean nodes from the cache; they re-materialize from the
    /// channel on the next read. Returns the number evicted.
    pub fn evict_clean_pages(&mut self) -> usize {
        let evicted = self.clean.len();
        self.clean.clear();
        evicted
    }
}
