//! # BurrowDB Index Engine
//!
//! BurrowDB's index core: an on-disk paged B+tree over 64-bit keys and
//! values, built for the object-database layers above it. This crate
//! deliberately covers only the index engine; object serialization,
//! schema metadata, queries and the session lifecycle live in the
//! enclosing system and talk to this crate through a handful of narrow
//! interfaces.
//!
//! ## What's Inside
//!
//! - **Prefix-compressed nodes**: a node's sorted keys share their
//!   high-order bits; the prefix is stored once and each key contributes
//!   only its suffix, packed at bit granularity.
//! - **Page-based buffer manager**: owns every loaded node, tracks the
//!   dirty set, materializes pages lazily and writes copy-on-write:
//!   every rewrite lands on a fresh page and renames the node, children
//!   first so parents always persist final child ids.
//! - **Transaction-aware iterators**: cursors hold page ids and
//!   positions, never node references; each step validates a
//!   `(transaction id, modification count)` stamp and fails fast instead
//!   of ever returning stale data.
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrowdb::{BTree, FileChannel, TreeConfig};
//!
//! let cfg = TreeConfig::new(4096, true, 8)?;
//! let channel = FileChannel::create("./users.idx", 4096)?;
//! let mut tree = BTree::create(channel, cfg)?;
//!
//! tree.insert(42, 4200)?;
//! assert_eq!(tree.search(42)?, Some(4200));
//!
//! let root_page = tree.commit()?; // persist this to find the tree again
//! ```
//!
//! ## Concurrency Model
//!
//! Single writer, many readers, all on the calling thread; the only
//! suspension points are storage-channel reads and writes. Readers that
//! outlive a commit or a concurrent mutation are not blocked; their
//! next call fails with a typed error and they must be discarded.
//!
//! ## Module Overview
//!
//! - [`btree`]: node model, tree algorithms, buffer manager, page image
//!   codec, iterators
//! - [`storage`]: storage channel trait, mmap-backed page file, free
//!   list
//! - [`session`]: iterator registry shared with the enclosing session
//! - [`config`]: layout constants
//! - [`error`]: typed error kinds surfaced through `eyre`

pub mod btree;
pub mod config;
pub mod error;
pub mod session;
pub mod storage;

pub use btree::{BTree, BTreeNode, BufferManager, Entry, LeafEntryIterator, PageId, TreeConfig};
pub use error::IndexError;
pub use session::IteratorRegistry;
pub use storage::{FileChannel, StorageChannel};
