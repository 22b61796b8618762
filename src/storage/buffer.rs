//! Buffer manager: keeps up to `capacity` page frames in memory, pinned
//! and unpinned by the tree walks above it. Eviction is second-chance
//! ("clock") over a random starting position and never touches a pinned
//! frame. Frames are reference-counted so the radix-tree cache can hold
//! weak back-references that die with the frame.

use anyhow::Result;
use rand::Rng;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

use super::disk::StorageManager;
use super::page::{Page, PageId};

/// A page resident in memory plus the bookkeeping the pool needs.
/// `dirty` means the bytes must reach disk before the frame is dropped;
/// `referenced` is the clock bit.
pub struct Frame<const P: usize> {
    pin: Cell<u32>,
    dirty: Cell<bool>,
    referenced: Cell<bool>,
    pub page: RefCell<Page<P>>,
}

impl<const P: usize> Frame<P> {
    pub(crate) fn new(page: Page<P>, pin: u32, dirty: bool) -> Rc<Self> {
        Rc::new(Self {
            pin: Cell::new(pin),
            dirty: Cell::new(dirty),
            referenced: Cell::new(true),
            page: RefCell::new(page),
        })
    }

    pub fn pin_count(&self) -> u32 {
        self.pin.get()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }
}

pub type FrameRef<const P: usize> = Rc<Frame<P>>;

pub struct BufferManager<const P: usize> {
    storage: StorageManager<P>,
    frames: HashMap<PageId, FrameRef<P>>,
    capacity: usize,
}

impl<const P: usize> BufferManager<P> {
    pub fn new(storage: StorageManager<P>, capacity: usize) -> Self {
        assert!(capacity > 0, "buffer pool must hold at least one frame");
        Self {
            storage,
            frames: HashMap::new(),
            capacity,
        }
    }

    /// Return the frame holding `page_id`, pinned exactly once by this
    /// call. Fetches from disk (evicting if the pool is full) on a miss.
    pub fn request_page(&mut self, page_id: PageId) -> Result<FrameRef<P>> {
        if let Some(frame) = self.frames.get(&page_id) {
            frame.pin.set(frame.pin.get() + 1);
            frame.referenced.set(true);
            return Ok(Rc::clone(frame));
        }

        if self.frames.len() >= self.capacity {
            self.evict()?;
        }
        let page = self.storage.load_page(page_id)?;
        assert_eq!(page.page_id(), page_id, "page id on disk does not match request");
        let frame = Frame::new(page, 1, false);
        self.frames.insert(page_id, Rc::clone(&frame));
        Ok(frame)
    }

    /// Allocate a fresh page id and hand back a pinned, dirty frame for
    /// it, formatted as a leaf-flagged empty page.
    pub fn create_new_page(&mut self) -> Result<FrameRef<P>> {
        if self.frames.len() >= self.capacity {
            self.evict()?;
        }
        let page_id = self.storage.get_unused_page_id();
        let frame = Frame::new(Page::new(page_id, false), 1, true);
        self.frames.insert(page_id, Rc::clone(&frame));
        debug!(page_id, "created page");
        Ok(frame)
    }

    /// Drop a pin; OR `dirty` into the frame's dirty bit. Unpinning a page
    /// that is absent or not pinned is an invariant violation.
    pub fn unfix_page(&mut self, page_id: PageId, dirty: bool) {
        let frame = self
            .frames
            .get(&page_id)
            .unwrap_or_else(|| panic!("unfixing non-resident page {page_id}"));
        let pin = frame.pin.get();
        assert!(pin > 0, "unfixing page {page_id} with pin count zero");
        frame.pin.set(pin - 1);
        frame.dirty.set(frame.dirty.get() || dirty);
    }

    /// Set the dirty bit without touching the pin count.
    pub fn mark_dirty(&mut self, page_id: PageId) {
        let frame = self
            .frames
            .get(&page_id)
            .unwrap_or_else(|| panic!("marking non-resident page {page_id} dirty"));
        frame.dirty.set(true);
    }

    /// Discard the frame and return its id to the storage manager. The
    /// contents are not flushed. The caller must hold no pins on it.
    pub fn delete_page(&mut self, page_id: PageId) {
        if let Some(frame) = self.frames.remove(&page_id) {
            assert!(frame.pin.get() == 0, "deleting pinned page {page_id}");
        }
        self.storage.delete_page(page_id);
    }

    /// Flush every dirty frame and drop the pool. Called on clean
    /// shutdown, before the storage manager truncates the file.
    pub fn destroy(&mut self) -> Result<()> {
        for frame in self.frames.values() {
            if frame.dirty.get() {
                self.storage.save_page(&frame.page.borrow())?;
            }
        }
        self.frames.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames currently pinned. Zero after every public tree operation.
    pub fn pinned_pages(&self) -> usize {
        self.frames.values().filter(|f| f.pin.get() > 0).count()
    }

    pub fn storage_mut(&mut self) -> &mut StorageManager<P> {
        &mut self.storage
    }

    /// Second-chance sweep from a random position: pinned frames are
    /// skipped, referenced frames lose their bit and survive one round,
    /// anything else is flushed if dirty and dropped.
    fn evict(&mut self) -> Result<()> {
        assert!(
            self.frames.values().any(|f| f.pin.get() == 0),
            "all buffer frames are pinned"
        );
        let ids: Vec<PageId> = self.frames.keys().copied().collect();
        let mut cursor = rand::thread_rng().gen_range(0..ids.len());
        loop {
            let id = ids[cursor % ids.len()];
            cursor += 1;
            let frame = &self.frames[&id];
            if frame.pin.get() > 0 {
                continue;
            }
            if frame.referenced.get() {
                frame.referenced.set(false);
                continue;
            }
            if frame.dirty.get() {
                self.storage.save_page(&frame.page.borrow())?;
            }
            debug!(page_id = id, "evicted page");
            self.frames.remove(&id);
            return Ok(());
        }
    }
}
