//! Storage manager: maps page ids to fixed-size slots in a single data
//! file and hands out dense page ids through a free-space bitmap. The
//! bitmap is not persisted; construction starts cold and discards any
//! prior file contents.

use anyhow::{ensure, Result};
use bitvec::prelude::*;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use super::page::{node_slots, Page, PageId};

pub const DATA_FILE: &str = "data.bin";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("page {0} does not exist")]
    PageOutOfRange(PageId),
}

/// Owns the data file. Page id `i` occupies bytes `i * P .. (i + 1) * P`;
/// bit `i` of the free map is 1 while the id is unallocated. Bit 0 is
/// permanently occupied so id 0 can serve as "none".
pub struct StorageManager<const P: usize> {
    base_path: PathBuf,
    file: File,
    /// 1 = free, 0 = occupied. Grows in increments of ceil(P / 8) * 8 bits.
    free: BitVec,
    page_count: u64,
    /// Index of the lowest free bit.
    next_free: usize,
}

impl<const P: usize> StorageManager<P> {
    const BITMAP_INCREMENT: usize = P.div_ceil(8) * 8;

    pub fn new(base_path: &Path) -> Result<Self> {
        assert!(P % 16 == 0, "page size must be a multiple of 16");
        assert!(node_slots(P) >= 4, "page size yields a fan-out below 3");

        if !base_path.exists() {
            std::fs::create_dir_all(base_path)?;
        } else {
            // cold start: previous data is scratch
            let _ = std::fs::remove_file(base_path.join(DATA_FILE));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(base_path.join(DATA_FILE))?;

        let mut free = bitvec![1; Self::BITMAP_INCREMENT];
        free.set(0, false);
        let mut sm = Self {
            base_path: base_path.to_path_buf(),
            file,
            free,
            page_count: 0,
            next_free: 1,
        };
        sm.find_next_free_space();
        Ok(sm)
    }

    /// Write the page at `page_id * P`. Extends the file through any
    /// intervening slots first; their content is irrelevant, only the
    /// length matters. Marks the id occupied.
    pub fn save_page(&mut self, page: &Page<P>) -> Result<()> {
        let page_id = page.page_id();
        while self.free.len() as u64 <= page_id {
            let len = self.free.len();
            self.free.resize(len + Self::BITMAP_INCREMENT, true);
        }

        if self.page_count <= page_id {
            self.file.seek(SeekFrom::End(0))?;
            while self.page_count <= page_id {
                self.file.write_all(page.as_bytes())?;
                self.page_count += 1;
            }
        } else {
            self.file.seek(SeekFrom::Start(page_id * P as u64))?;
            self.file.write_all(page.as_bytes())?;
        }
        self.file.flush()?;

        self.free.set(page_id as usize, false);
        self.find_next_free_space();
        Ok(())
    }

    /// Read the page stored at `page_id * P`.
    pub fn load_page(&mut self, page_id: PageId) -> Result<Page<P>> {
        ensure!(page_id < self.page_count, StorageError::PageOutOfRange(page_id));
        self.file.seek(SeekFrom::Start(page_id * P as u64))?;
        let mut page = Page::zeroed();
        self.file.read_exact(page.as_bytes_mut())?;
        Ok(page)
    }

    /// Return `page_id` to the free pool and keep the allocation dense.
    pub fn delete_page(&mut self, page_id: PageId) {
        assert!(page_id != 0, "deleting reserved page 0");
        if (self.free.len() as u64) > page_id {
            self.free.set(page_id as usize, true);
        }
        if (page_id as usize) < self.next_free {
            self.next_free = page_id as usize;
        }
    }

    /// Hand out the lowest free page id and mark it occupied. The caller
    /// is expected to write the page eventually.
    pub fn get_unused_page_id(&mut self) -> PageId {
        let next = self.next_free;
        self.free.set(next, false);
        self.find_next_free_space();
        debug!(page_id = next, "allocated page id");
        next as PageId
    }

    /// Truncate the data file on clean shutdown; the store is scratch.
    pub fn destroy(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn find_next_free_space(&mut self) {
        match self.free[self.next_free..].first_one() {
            Some(offset) => self.next_free += offset,
            None => {
                let prev = self.free.len();
                self.free.resize(prev + Self::BITMAP_INCREMENT, true);
                self.next_free = prev;
            }
        }
    }
}
