//! # Memory-Mapped Page File
//!
//! [`FileChannel`] implements the storage channel over a single
//! memory-mapped file of concatenated fixed-size pages:
//!
//! ```text
//! Offset 0:              Page 0 (reserved for enclosing metadata)
//! Offset page_size:      Page 1
//! Offset 2 * page_size:  Page 2
//! ...
//! ```
//!
//! ## Safety Model
//!
//! A mapped region becomes invalid when the file is grown and remapped.
//! Instead of runtime guards, the borrow checker enforces safety at
//! compile time: `read_page` borrows `&self`, while `grow` (reached only
//! through `allocate_page`) needs `&mut self`, so no page slice can
//! outlive a remap.
//!
//! ## Allocation
//!
//! `allocate_page` pops the in-memory free list first and grows the file
//! by one page otherwise. The free list is not persisted; this layer has
//! no crash-recovery story by design, and a reopened file may carry
//! unreachable pages until the enclosing system rewrites them.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use super::{Freelist, StorageChannel, FIRST_DATA_PAGE};
use crate::config::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};

#[derive(Debug)]
pub struct FileChannel {
    file: File,
    mmap: MmapMut,
    page_size: usize,
    page_count: u32,
    freelist: Freelist,
}

impl FileChannel {
    /// Creates a fresh page file containing only the reserved page 0.
    pub fn create<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let path = path.as_ref();
        ensure!(
            (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
            "page size {} outside supported range",
            page_size
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create page file '{}'", path.display()))?;

        file.set_len(page_size as u64)
            .wrap_err("failed to size fresh page file")?;

        // SAFETY: the file was just created with exclusive read/write
        // access and sized to a whole page. The mapping lives inside
        // FileChannel and all access is bounds-checked against
        // page_count, so the region cannot be outlived or overrun.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_size,
            page_count: 1,
            freelist: Freelist::new(),
        })
    }

    /// Opens an existing page file. `page_size` must match the size the
    /// file was created with.
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let path = path.as_ref();
        ensure!(
            (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
            "page size {} outside supported range",
            page_size
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open page file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(file_size > 0, "page file '{}' is empty", path.display());
        ensure!(
            file_size % page_size as u64 == 0,
            "page file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            page_size
        );

        // SAFETY: the file is opened read/write by this process; the
        // mapping's lifetime is tied to FileChannel and every access is
        // bounds-checked against page_count.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_size,
            page_count: (file_size / page_size as u64) as u32,
            freelist: Freelist::new(),
        })
    }

    fn grow(&mut self, new_page_count: u32) -> Result<()> {
        if new_page_count <= self.page_count {
            return Ok(());
        }

        self.mmap
            .flush_async()
            .wrap_err("failed to flush mapping before grow")?;

        let new_size = new_page_count as u64 * self.page_size as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend page file to {} bytes", new_size))?;

        // SAFETY: grow holds &mut self, so no page slice is alive; the
        // file was extended before remapping and the old mapping is
        // dropped by the assignment.
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file).wrap_err("failed to remap page file after grow")?
        };
        self.page_count = new_page_count;

        Ok(())
    }

    pub fn free_page_count(&self) -> usize {
        self.freelist.len()
    }
}

impl StorageChannel for FileChannel {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn allocate_page(&mut self) -> Result<u32> {
        if let Some(page_no) = self.freelist.pop() {
            return Ok(page_no);
        }
        let page_no = self.page_count;
        self.grow(page_no + 1)?;
        Ok(page_no)
    }

    fn free_page(&mut self, page_no: u32) {
        if page_no >= FIRST_DATA_PAGE && page_no < self.page_count {
            self.freelist.push(page_no);
        }
    }

    fn read_page(&self, page_no: u32) -> Result<&[u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );
        let offset = page_no as usize * self.page_size;
        Ok(&self.mmap[offset..offset + self.page_size])
    }

    fn write_page(&mut self, page_no: u32, data: &[u8]) -> Result<()> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );
        ensure!(
            data.len() == self.page_size,
            "write of {} bytes into a {}-byte page",
            data.len(),
            self.page_size
        );
        let offset = page_no as usize * self.page_size;
        self.mmap[offset..offset + self.page_size].copy_from_slice(data);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync page file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_channel(page_size: usize) -> (tempfile::TempDir, FileChannel) {
        let dir = tempdir().unwrap();
        let channel = FileChannel::create(dir.path().join("index.pag"), page_size).unwrap();
        (dir, channel)
    }

    #[test]
    fn create_reserves_page_zero() {
        let (_dir, channel) = create_channel(128);
        assert_eq!(channel.page_count(), 1);
    }

    #[test]
    fn allocate_grows_then_reuses_freed_pages() {
        let (_dir, mut channel) = create_channel(128);

        let a = channel.allocate_page().unwrap();
        let b = channel.allocate_page().unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(channel.page_count(), 3);

        channel.free_page(a);
        assert_eq!(channel.allocate_page().unwrap(), a);
        assert_eq!(channel.page_count(), 3);
    }

    #[test]
    fn write_read_round_trip() {
        let (_dir, mut channel) = create_channel(128);
        let page_no = channel.allocate_page().unwrap();

        let mut data = vec![0u8; 128];
        data[0] = 0xAB;
        data[127] = 0xCD;
        channel.write_page(page_no, &data).unwrap();

        assert_eq!(channel.read_page(page_no).unwrap(), data.as_slice());
    }

    #[test]
    fn short_write_is_rejected() {
        let (_dir, mut channel) = create_channel(128);
        let page_no = channel.allocate_page().unwrap();
        assert!(channel.write_page(page_no, &[0u8; 64]).is_err());
    }

    #[test]
    fn out_of_bounds_read_is_rejected() {
        let (_dir, channel) = create_channel(128);
        let err = channel.read_page(10).unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[test]
    fn reopen_preserves_written_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.pag");

        let page_no;
        {
            let mut channel = FileChannel::create(&path, 128).unwrap();
            page_no = channel.allocate_page().unwrap();
            channel.write_page(page_no, &[0x5A; 128]).unwrap();
            channel.sync().unwrap();
        }

        let channel = FileChannel::open(&path, 128).unwrap();
        assert_eq!(channel.page_count(), 2);
        assert_eq!(channel.read_page(page_no).unwrap(), &[0x5A; 128][..]);
    }

    #[test]
    fn free_page_ignores_reserved_and_out_of_range() {
        let (_dir, mut channel) = create_channel(128);
        channel.free_page(0);
        channel.free_page(99);
        assert_eq!(channel.free_page_count(), 0);
    }
}
