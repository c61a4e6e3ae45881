//! # Storage Layer
//!
//! This module defines the storage channel the index core writes through:
//! fixed-size page I/O with copy-on-write allocation. The channel knows
//! nothing about nodes: it moves opaque page-sized byte blocks and hands
//! out page numbers.
//!
//! ## Contract
//!
//! - `allocate_page` returns a reusable page number, preferring the free
//!   list over growing the file.
//! - `read_page` / `write_page` move whole pages; partial I/O is not part
//!   of the interface.
//! - `free_page` returns a page to the free list for later reuse. The
//!   free list is in-memory state: this layer implements no transaction
//!   log or crash recovery, so a channel reopened after a crash simply
//!   starts with an empty free list.
//! - Page 0 is reserved for the enclosing system's metadata (the
//!   committed root page id lives there, outside this crate's scope);
//!   channels never hand it out.
//!
//! ## Implementations
//!
//! [`FileChannel`] memory-maps a page file and grows it on demand. Its
//! `grow` takes `&mut self`, so the borrow checker retires any
//! outstanding page slices before the mapping is replaced.

mod file;
mod freelist;

pub use file::FileChannel;
pub use freelist::Freelist;

use eyre::Result;

/// First page number a channel may hand out; page 0 holds enclosing
/// metadata.
pub const FIRST_DATA_PAGE: u32 = 1;

pub trait StorageChannel {
    /// Fixed page size in bytes.
    fn page_size(&self) -> usize;

    /// Number of pages currently addressable, page 0 included.
    fn page_count(&self) -> u32;

    /// Hands out a page number for a subsequent `write_page`, reusing a
    /// freed page when possible.
    fn allocate_page(&mut self) -> Result<u32>;

    /// Returns a page to the free list.
    fn free_page(&mut self, page_no: u32);

    /// Reads one page; the slice is valid until the next `&mut self`
    /// call.
    fn read_page(&self, page_no: u32) -> Result<&[u8]>;

    /// Writes one full page.
    fn write_page(&mut self, page_no: u32, data: &[u8]) -> Result<()>;

    /// Flushes written pages to durable storage.
    fn sync(&self) -> Result<()>;
}
