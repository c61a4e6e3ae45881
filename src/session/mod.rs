//! # Iterator Registry
//!
//! Glue between the index core and the enclosing session: every open
//! cursor registers here, and the session closes them all at the
//! transaction boundary. The registry is shared state
//! (`parking_lot::Mutex`) because cursors are owned by callers while the
//! session drives commit and rollback.
//!
//! A closed cursor's next validation fails with
//! `IteratorInvalidatedByCommit`, matching the transaction-id stamp
//! check; the registry exists so the session can also account for and
//! release outstanding cursors eagerly rather than waiting for callers
//! to touch them again.

use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: u64,
    open: HashSet<u64>,
}

#[derive(Debug, Default)]
pub struct IteratorRegistry {
    inner: Mutex<RegistryInner>,
}

impl IteratorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a new cursor; the handle deregisters itself on drop.
    pub fn register(self: &Arc<Self>) -> CursorHandle {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.open.insert(id);
        CursorHandle {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Closes every outstanding cursor (called on commit and rollback).
    /// Returns how many were open.
    pub fn close_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let closed = inner.open.len();
        inner.open.clear();
        closed
    }

    pub fn open_cursors(&self) -> usize {
        self.inner.lock().open.len()
    }

    fn is_open(&self, id: u64) -> bool {
        self.inner.lock().open.contains(&id)
    }

    fn deregister(&self, id: u64) {
        self.inner.lock().open.remove(&id);
    }
}

#[derive(Debug)]
pub struct CursorHandle {
    registry: Arc<IteratorRegistry>,
    id: u64,
}

impl CursorHandle {
    pub fn is_closed(&self) -> bool {
        !self.registry.is_open(self.id)
    }
}

impl Drop for CursorHandle {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}
