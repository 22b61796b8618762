//! B+-tree over buffer-managed pages. Keys and values are `i64`; leaves
//! are chained in key order. Descents pin parent and child crab-wise:
//! the parent stays pinned until the right child is pinned, then is
//! released. Inserts split full children before descending into them;
//! deletes rebalance (borrow from a sibling, else merge) before
//! descending, so a leaf can always absorb the operation.

pub mod node;

use anyhow::Result;
use std::rc::Rc;
use tracing::debug;

use crate::cache::RadixTree;
use crate::storage::{BufferManager, FrameRef, PageId};
use crate::ABSENT;
use node::{InnerNode, LeafNode};

pub struct BPlusTree<const P: usize> {
    root_id: PageId,
}

impl<const P: usize> BPlusTree<P> {
    /// Create the tree with a single empty leaf as root.
    pub fn new(buffer: &mut BufferManager<P>) -> Result<Self> {
        let frame = buffer.create_new_page()?;
        let root_id = {
            let mut page = frame.page.borrow_mut();
            LeafNode::init(&mut page);
            page.page_id()
        };
        buffer.unfix_page(root_id, true);
        Ok(Self { root_id })
    }

    pub fn root_id(&self) -> PageId {
        self.root_id
    }

    /// Insert `(key, value)`. Duplicate keys always create a new entry.
    pub fn insert(
        &mut self,
        buffer: &mut BufferManager<P>,
        cache: Option<&mut RadixTree<P>>,
        key: i64,
        value: i64,
    ) -> Result<()> {
        let root = buffer.request_page(self.root_id)?;
        self.insert_rec(buffer, cache, root, key, value)
    }

    /// Remove one entry for `key`. No-op if the key is absent.
    pub fn delete_value(
        &mut self,
        buffer: &mut BufferManager<P>,
        cache: Option<&mut RadixTree<P>>,
        key: i64,
    ) -> Result<()> {
        let root = buffer.request_page(self.root_id)?;
        self.delete_rec(buffer, cache, root, key)
    }

    /// Value stored under `key`, or the absent sentinel. A hit refreshes
    /// the cache entry for the leaf it was found on.
    pub fn get_value(
        &self,
        buffer: &mut BufferManager<P>,
        mut cache: Option<&mut RadixTree<P>>,
        key: i64,
    ) -> Result<i64> {
        let mut frame = buffer.request_page(self.root_id)?;
        loop {
            let (page_id, is_inner) = Self::header_of(&frame);
            if is_inner {
                let child_id = InnerNode::child_for(&frame.page.borrow(), key);
                let child = buffer.request_page(child_id)?;
                buffer.unfix_page(page_id, false);
                frame = child;
            } else {
                let value = LeafNode::get(&frame.page.borrow(), key);
                if value != ABSENT {
                    if let Some(c) = cache.as_deref_mut() {
                        c.insert(key, page_id, Rc::downgrade(&frame));
                    }
                }
                buffer.unfix_page(page_id, false);
                return Ok(value);
            }
        }
    }

    /// Replace the value for `key` in place. No-op if the key is absent.
    pub fn update(
        &self,
        buffer: &mut BufferManager<P>,
        mut cache: Option<&mut RadixTree<P>>,
        key: i64,
        value: i64,
    ) -> Result<()> {
        let mut frame = buffer.request_page(self.root_id)?;
        loop {
            let (page_id, is_inner) = Self::header_of(&frame);
            if is_inner {
                let child_id = InnerNode::child_for(&frame.page.borrow(), key);
                let child = buffer.request_page(child_id)?;
                buffer.unfix_page(page_id, false);
                frame = child;
            } else {
                let changed = LeafNode::update(&mut frame.page.borrow_mut(), key, value);
                if changed {
                    if let Some(c) = cache.as_deref_mut() {
                        c.insert(key, page_id, Rc::downgrade(&frame));
                    }
                }
                buffer.unfix_page(page_id, changed);
                return Ok(());
            }
        }
    }

    /// XOR the values of up to `range` consecutive entries starting at
    /// `key`, following the leaf chain. Returns the absent sentinel when
    /// `key` itself is missing; a reduction that collides with the
    /// sentinel is reported as sentinel + 1.
    pub fn scan(
        &self,
        buffer: &mut BufferManager<P>,
        mut cache: Option<&mut RadixTree<P>>,
        key: i64,
        range: usize,
    ) -> Result<i64> {
        let mut frame = buffer.request_page(self.root_id)?;
        let mut page_id;
        loop {
            let (id, is_inner) = Self::header_of(&frame);
            page_id = id;
            if !is_inner {
                break;
            }
            let child_id = InnerNode::child_for(&frame.page.borrow(), key);
            let child = buffer.request_page(child_id)?;
            buffer.unfix_page(page_id, false);
            frame = child;
        }

        let mut index = LeafNode::lower_bound(&frame.page.borrow(), key);
        let found = {
            let page = frame.page.borrow();
            index != LeafNode::count(&page) && LeafNode::key(&page, index) == key
        };
        if !found {
            buffer.unfix_page(page_id, false);
            return Ok(ABSENT);
        }
        if let Some(c) = cache.as_deref_mut() {
            c.insert(key, page_id, Rc::downgrade(&frame));
        }

        let mut acc: i64 = 0;
        let mut scanned = 0;
        while scanned < range {
            let (count, next) = {
                let page = frame.page.borrow();
                (LeafNode::count(&page), LeafNode::next_leaf(&page))
            };
            if index == count {
                if next == 0 {
                    break;
                }
                let next_frame = buffer.request_page(next)?;
                buffer.unfix_page(page_id, false);
                frame = next_frame;
                page_id = next;
                index = 0;
                continue;
            }
            acc ^= LeafNode::value(&frame.page.borrow(), index);
            index += 1;
            scanned += 1;
        }
        buffer.unfix_page(page_id, false);
        Ok(if acc == ABSENT { ABSENT + 1 } else { acc })
    }

    /// All three structural predicates: balanced, ordered, and a leaf
    /// chain visiting exactly `expected` keys in ascending order.
    pub fn validate(&self, buffer: &mut BufferManager<P>, expected: usize) -> Result<bool> {
        Ok(self.is_balanced(buffer)?
            && self.is_ordered(buffer)?
            && self.is_concatenated(buffer, expected)?)
    }

    fn header_of(frame: &FrameRef<P>) -> (PageId, bool) {
        let page = frame.page.borrow();
        (page.page_id(), page.is_inner())
    }

    /// Index of the first entry of the upper half when splitting a full
    /// node of capacity `max`.
    fn split_index(max: usize) -> usize {
        if max % 2 == 0 {
            max / 2
        } else {
            max / 2 + 1
        }
    }

    fn insert_rec(
        &mut self,
        buffer: &mut BufferManager<P>,
        mut cache: Option<&mut RadixTree<P>>,
        frame: FrameRef<P>,
        key: i64,
        value: i64,
    ) -> Result<()> {
        let (page_id, is_inner) = Self::header_of(&frame);
        debug!(page_id, key, "insert descent");
        if !is_inner {
            if page_id == self.root_id && LeafNode::is_full(&frame.page.borrow()) {
                // the only case where a leaf can still be full: a
                // single-leaf tree. Split it and grow a root above.
                let (split_key, new_leaf) = self.split_leaf(buffer, cache.as_deref_mut(), &frame)?;
                let root_frame = self.grow_root(buffer, page_id, split_key, new_leaf)?;
                buffer.unfix_page(page_id, true);
                return self.insert_rec(buffer, cache, root_frame, key, value);
            }
            LeafNode::insert(&mut frame.page.borrow_mut(), key, value);
            if let Some(c) = cache.as_deref_mut() {
                c.insert(key, page_id, Rc::downgrade(&frame));
            }
            buffer.unfix_page(page_id, true);
            return Ok(());
        }

        if page_id == self.root_id && InnerNode::is_full(&frame.page.borrow()) {
            let (split_key, new_inner) = self.split_inner(buffer, &frame)?;
            let root_frame = self.grow_root(buffer, page_id, split_key, new_inner)?;
            buffer.unfix_page(page_id, true);
            return self.insert_rec(buffer, cache, root_frame, key, value);
        }

        let child_id = InnerNode::child_for(&frame.page.borrow(), key);
        let child = buffer.request_page(child_id)?;
        let (child_inner, child_full) = {
            let page = child.page.borrow();
            if page.is_inner() {
                (true, InnerNode::is_full(&page))
            } else {
                (false, LeafNode::is_full(&page))
            }
        };
        if child_full {
            // split before descending so the child can take the insert
            let (split_key, new_id) = if child_inner {
                self.split_inner(buffer, &child)?
            } else {
                self.split_leaf(buffer, cache.as_deref_mut(), &child)?
            };
            InnerNode::insert(&mut frame.page.borrow_mut(), split_key, new_id);
            buffer.unfix_page(child_id, true);
            let next_id = InnerNode::child_for(&frame.page.borrow(), key);
            let child = buffer.request_page(next_id)?;
            buffer.unfix_page(page_id, true);
            self.insert_rec(buffer, cache, child, key, value)
        } else {
            buffer.unfix_page(page_id, false);
            self.insert_rec(buffer, cache, child, key, value)
        }
    }

    /// Install a fresh inner root above a just-split old root.
    fn grow_root(
        &mut self,
        buffer: &mut BufferManager<P>,
        old_root: PageId,
        split_key: i64,
        right: PageId,
    ) -> Result<FrameRef<P>> {
        let root_frame = buffer.create_new_page()?;
        let new_root_id = {
            let mut page = root_frame.page.borrow_mut();
            InnerNode::init(&mut page);
            InnerNode::set_child_id(&mut page, 0, old_root);
            InnerNode::insert(&mut page, split_key, right);
            page.page_id()
        };
        debug!(old_root, new_root = new_root_id, "root split");
        self.root_id = new_root_id;
        Ok(root_frame)
    }

    /// Move the upper half of a full leaf into a fresh right sibling and
    /// rewire the chain. Returns the separator key and the new page id.
    fn split_leaf(
        &mut self,
        buffer: &mut BufferManager<P>,
        cache: Option<&mut RadixTree<P>>,
        frame: &FrameRef<P>,
    ) -> Result<(i64, PageId)> {
        let new_frame = buffer.create_new_page()?;
        let new_id = new_frame.page.borrow().page_id();
        let split_key = {
            let mut old = frame.page.borrow_mut();
            assert!(!old.is_inner(), "leaf split on an inner page");
            assert!(LeafNode::is_full(&old), "splitting a leaf that is not full");
            let mut fresh = new_frame.page.borrow_mut();
            LeafNode::init(&mut fresh);

            let count = LeafNode::count(&old);
            let split = Self::split_index(LeafNode::max_size(&old));
            let split_key = LeafNode::key(&old, split - 1);
            if let Some(c) = cache {
                // redirect cached hints for everything that migrates
                c.update_range(
                    LeafNode::key(&old, split),
                    LeafNode::key(&old, count - 1),
                    new_id,
                    Rc::downgrade(&new_frame),
                );
            }
            for i in split..count {
                LeafNode::insert(&mut fresh, LeafNode::key(&old, i), LeafNode::value(&old, i));
            }
            LeafNode::set_count(&mut old, split);
            LeafNode::set_next_leaf(&mut fresh, LeafNode::next_leaf(&old));
            LeafNode::set_next_leaf(&mut old, new_id);
            split_key
        };
        buffer.unfix_page(new_id, true);
        Ok((split_key, new_id))
    }

    /// Split a full inner node; the median separator is promoted, not
    /// copied.
    fn split_inner(
        &mut self,
        buffer: &mut BufferManager<P>,
        frame: &FrameRef<P>,
    ) -> Result<(i64, PageId)> {
        let new_frame = buffer.create_new_page()?;
        let new_id = new_frame.page.borrow().page_id();
        let promoted = {
            let mut old = frame.page.borrow_mut();
            assert!(old.is_inner(), "inner split on a leaf page");
            assert!(InnerNode::is_full(&old), "splitting an inner node that is not full");
            let mut fresh = new_frame.page.borrow_mut();
            InnerNode::init(&mut fresh);

            let count = InnerNode::count(&old);
            let split = Self::split_index(InnerNode::max_size(&old));
            InnerNode::set_child_id(&mut fresh, 0, InnerNode::child_id(&old, split));
            for i in split..count {
                InnerNode::insert(&mut fresh, InnerNode::key(&old, i), InnerNode::child_id(&old, i + 1));
            }
            let promoted = InnerNode::key(&old, split - 1);
            InnerNode::set_count(&mut old, split - 1);
            promoted
        };
        buffer.unfix_page(new_id, true);
        Ok((promoted, new_id))
    }

    fn delete_rec(
        &mut self,
        buffer: &mut BufferManager<P>,
        mut cache: Option<&mut RadixTree<P>>,
        frame: FrameRef<P>,
        key: i64,
    ) -> Result<()> {
        let (page_id, is_inner) = Self::header_of(&frame);
        debug!(page_id, key, "delete descent");
        if !is_inner {
            let removed = LeafNode::remove(&mut frame.page.borrow_mut(), key);
            if removed {
                if let Some(c) = cache.as_deref_mut() {
                    c.delete_reference(key);
                }
            }
            buffer.unfix_page(page_id, removed);
            return Ok(());
        }

        if page_id == self.root_id && InnerNode::count(&frame.page.borrow()) == 0 {
            // a merge emptied the root; its single child takes over
            let only_child = InnerNode::child_id(&frame.page.borrow(), 0);
            debug!(old_root = page_id, new_root = only_child, "root collapse");
            self.root_id = only_child;
            buffer.unfix_page(page_id, false);
            buffer.delete_page(page_id);
            return self.delete_value(buffer, cache, key);
        }

        let child_id = InnerNode::child_for(&frame.page.borrow(), key);
        let mut child = buffer.request_page(child_id)?;
        let child_has_spare = {
            let page = child.page.borrow();
            if page.is_inner() {
                InnerNode::has_spare(&page)
            } else {
                LeafNode::has_spare(&page)
            }
        };
        if !child_has_spare {
            // the child could underflow; rebalance it before descending
            if self.substitute(buffer, cache.as_deref_mut(), &frame, &child)? {
                buffer.unfix_page(child_id, true);
            } else {
                self.merge(buffer, cache.as_deref_mut(), &frame, &child)?;
            }
            buffer.mark_dirty(page_id);
            return self.delete_rec(buffer, cache, frame, key);
        }

        let mut parent_dirty = false;
        if InnerNode::contains(&frame.page.borrow(), key) {
            // the key doubles as a separator here; swap it for its
            // predecessor so it dies in the leaf below
            let predecessor = self.find_biggest(buffer, child)?;
            InnerNode::exchange(&mut frame.page.borrow_mut(), key, predecessor);
            child = buffer.request_page(child_id)?;
            parent_dirty = true;
        }
        buffer.unfix_page(page_id, parent_dirty);
        self.delete_rec(buffer, cache, child, key)
    }

    /// Predecessor of the separator currently being deleted: the
    /// second-biggest key of the subtree's rightmost leaf (the biggest is
    /// the separator itself). Consumes the pin on `frame`.
    fn find_biggest(&self, buffer: &mut BufferManager<P>, frame: FrameRef<P>) -> Result<i64> {
        let (page_id, is_inner) = Self::header_of(&frame);
        if !is_inner {
            let key = {
                let page = frame.page.borrow();
                LeafNode::key(&page, LeafNode::count(&page) - 2)
            };
            buffer.unfix_page(page_id, false);
            return Ok(key);
        }
        let child_id = {
            let page = frame.page.borrow();
            InnerNode::child_id(&page, InnerNode::count(&page))
        };
        let child = buffer.request_page(child_id)?;
        buffer.unfix_page(page_id, false);
        self.find_biggest(buffer, child)
    }

    /// Position of `child` among the parent's child ids.
    fn child_index(parent: &FrameRef<P>, child_id: PageId) -> usize {
        let page = parent.page.borrow();
        let count = InnerNode::count(&page);
        for i in 0..=count {
            if InnerNode::child_id(&page, i) == child_id {
                return i;
            }
        }
        panic!("page {child_id} is not a child of page {}", page.page_id());
    }

    /// Borrow one entry from the left sibling if it can spare one, else
    /// from the right, moving it across the parent separator. Returns
    /// false when both siblings sit at minimum fill.
    fn substitute(
        &mut self,
        buffer: &mut BufferManager<P>,
        mut cache: Option<&mut RadixTree<P>>,
        parent: &FrameRef<P>,
        child: &FrameRef<P>,
    ) -> Result<bool> {
        let (child_id, child_inner) = Self::header_of(child);
        let index = Self::child_index(parent, child_id);
        let parent_count = InnerNode::count(&parent.page.borrow());

        if index > 0 {
            let sibling_id = InnerNode::child_id(&parent.page.borrow(), index - 1);
            let sibling = buffer.request_page(sibling_id)?;
            let can_spare = {
                let page = sibling.page.borrow();
                if child_inner {
                    InnerNode::has_spare(&page)
                } else {
                    LeafNode::has_spare(&page)
                }
            };
            if can_spare {
                if child_inner {
                    let mut parent_page = parent.page.borrow_mut();
                    let mut child_page = child.page.borrow_mut();
                    let mut sibling_page = sibling.page.borrow_mut();
                    let last = InnerNode::count(&sibling_page);
                    InnerNode::insert_first(
                        &mut child_page,
                        InnerNode::key(&parent_page, index - 1),
                        InnerNode::child_id(&sibling_page, last),
                    );
                    let moved = InnerNode::key(&sibling_page, last - 1);
                    InnerNode::set_key(&mut parent_page, index - 1, moved);
                    InnerNode::remove(&mut sibling_page, moved);
                } else {
                    let moved_key;
                    {
                        let mut parent_page = parent.page.borrow_mut();
                        let mut child_page = child.page.borrow_mut();
                        let mut sibling_page = sibling.page.borrow_mut();
                        let last = LeafNode::count(&sibling_page) - 1;
                        moved_key = LeafNode::key(&sibling_page, last);
                        LeafNode::insert(&mut child_page, moved_key, LeafNode::value(&sibling_page, last));
                        LeafNode::remove(&mut sibling_page, moved_key);
                        let new_last = LeafNode::count(&sibling_page) - 1;
                        InnerNode::set_key(&mut parent_page, index - 1, LeafNode::key(&sibling_page, new_last));
                    }
                    if let Some(c) = cache.as_deref_mut() {
                        c.insert(moved_key, child_id, Rc::downgrade(child));
                    }
                }
                buffer.unfix_page(sibling_id, true);
                return Ok(true);
            }
            buffer.unfix_page(sibling_id, false);
        }

        if index < parent_count {
            let sibling_id = InnerNode::child_id(&parent.page.borrow(), index + 1);
            let sibling = buffer.request_page(sibling_id)?;
            let can_spare = {
                let page = sibling.page.borrow();
                if child_inner {
                    InnerNode::has_spare(&page)
                } else {
                    LeafNode::has_spare(&page)
                }
            };
            if can_spare {
                if child_inner {
                    let mut parent_page = parent.page.borrow_mut();
                    let mut child_page = child.page.borrow_mut();
                    let mut sibling_page = sibling.page.borrow_mut();
                    InnerNode::insert(
                        &mut child_page,
                        InnerNode::key(&parent_page, index),
                        InnerNode::child_id(&sibling_page, 0),
                    );
                    InnerNode::set_key(&mut parent_page, index, InnerNode::key(&sibling_page, 0));
                    InnerNode::remove_first(&mut sibling_page);
                } else {
                    let moved_key;
                    {
                        let mut parent_page = parent.page.borrow_mut();
                        let mut child_page = child.page.borrow_mut();
                        let mut sibling_page = sibling.page.borrow_mut();
                        moved_key = LeafNode::key(&sibling_page, 0);
                        LeafNode::insert(&mut child_page, moved_key, LeafNode::value(&sibling_page, 0));
                        InnerNode::set_key(&mut parent_page, index, moved_key);
                        LeafNode::remove(&mut sibling_page, moved_key);
                    }
                    if let Some(c) = cache.as_deref_mut() {
                        c.insert(moved_key, child_id, Rc::downgrade(child));
                    }
                }
                buffer.unfix_page(sibling_id, true);
                return Ok(true);
            }
            buffer.unfix_page(sibling_id, false);
        }
        Ok(false)
    }

    /// Concatenate `child` with a sibling at minimum fill, pulling the
    /// separator down for inner merges. Consumes the pin on `child`
    /// (the emptied page is deleted, the survivor unfixed dirty).
    fn merge(
        &mut self,
        buffer: &mut BufferManager<P>,
        mut cache: Option<&mut RadixTree<P>>,
        parent: &FrameRef<P>,
        child: &FrameRef<P>,
    ) -> Result<()> {
        let (child_id, child_inner) = Self::header_of(child);
        let index = Self::child_index(parent, child_id);
        let parent_count = InnerNode::count(&parent.page.borrow());

        if index > 0 {
            let sibling_id = InnerNode::child_id(&parent.page.borrow(), index - 1);
            let sibling = buffer.request_page(sibling_id)?;
            let at_minimum = {
                let page = sibling.page.borrow();
                if child_inner {
                    !InnerNode::has_spare(&page)
                } else {
                    !LeafNode::has_spare(&page)
                }
            };
            if at_minimum {
                // child drains into its left sibling
                if child_inner {
                    let mut parent_page = parent.page.borrow_mut();
                    let child_page = child.page.borrow();
                    let mut sibling_page = sibling.page.borrow_mut();
                    let separator = InnerNode::key(&parent_page, index - 1);
                    InnerNode::insert(&mut sibling_page, separator, InnerNode::child_id(&child_page, 0));
                    for i in 0..InnerNode::count(&child_page) {
                        InnerNode::insert(
                            &mut sibling_page,
                            InnerNode::key(&child_page, i),
                            InnerNode::child_id(&child_page, i + 1),
                        );
                    }
                    InnerNode::remove(&mut parent_page, separator);
                } else {
                    if let Some(c) = cache.as_deref_mut() {
                        let child_page = child.page.borrow();
                        c.update_range(
                            LeafNode::key(&child_page, 0),
                            LeafNode::key(&child_page, LeafNode::count(&child_page) - 1),
                            sibling_id,
                            Rc::downgrade(&sibling),
                        );
                    }
                    let mut parent_page = parent.page.borrow_mut();
                    let child_page = child.page.borrow();
                    let mut sibling_page = sibling.page.borrow_mut();
                    for i in 0..LeafNode::count(&child_page) {
                        LeafNode::insert(&mut sibling_page, LeafNode::key(&child_page, i), LeafNode::value(&child_page, i));
                    }
                    LeafNode::set_next_leaf(&mut sibling_page, LeafNode::next_leaf(&child_page));
                    let separator = InnerNode::key(&parent_page, index - 1);
                    InnerNode::remove(&mut parent_page, separator);
                }
                buffer.unfix_page(child_id, false);
                buffer.delete_page(child_id);
                buffer.unfix_page(sibling_id, true);
                return Ok(());
            }
            buffer.unfix_page(sibling_id, false);
        }

        if index < parent_count {
            let sibling_id = InnerNode::child_id(&parent.page.borrow(), index + 1);
            let sibling = buffer.request_page(sibling_id)?;
            let at_minimum = {
                let page = sibling.page.borrow();
                if child_inner {
                    !InnerNode::has_spare(&page)
                } else {
                    !LeafNode::has_spare(&page)
                }
            };
            if at_minimum {
                // right sibling drains into child
                if child_inner {
                    let mut parent_page = parent.page.borrow_mut();
                    let mut child_page = child.page.borrow_mut();
                    let sibling_page = sibling.page.borrow();
                    let separator = InnerNode::key(&parent_page, index);
                    InnerNode::insert(&mut child_page, separator, InnerNode::child_id(&sibling_page, 0));
                    for i in 0..InnerNode::count(&sibling_page) {
                        InnerNode::insert(
                            &mut child_page,
                            InnerNode::key(&sibling_page, i),
                            InnerNode::child_id(&sibling_page, i + 1),
                        );
                    }
                    InnerNode::remove(&mut parent_page, separator);
                } else {
                    if let Some(c) = cache.as_deref_mut() {
                        let sibling_page = sibling.page.borrow();
                        c.update_range(
                            LeafNode::key(&sibling_page, 0),
                            LeafNode::key(&sibling_page, LeafNode::count(&sibling_page) - 1),
                            child_id,
                            Rc::downgrade(child),
                        );
                    }
                    let mut parent_page = parent.page.borrow_mut();
                    let mut child_page = child.page.borrow_mut();
                    let sibling_page = sibling.page.borrow();
                    for i in 0..LeafNode::count(&sibling_page) {
                        LeafNode::insert(&mut child_page, LeafNode::key(&sibling_page, i), LeafNode::value(&sibling_page, i));
                    }
                    LeafNode::set_next_leaf(&mut child_page, LeafNode::next_leaf(&sibling_page));
                    let separator = InnerNode::key(&parent_page, index);
                    InnerNode::remove(&mut parent_page, separator);
                }
                buffer.unfix_page(sibling_id, false);
                buffer.delete_page(sibling_id);
                buffer.unfix_page(child_id, true);
                return Ok(());
            }
            buffer.unfix_page(sibling_id, false);
        }
        panic!("merge called for page {child_id} with no sibling at minimum fill");
    }

    fn is_balanced(&self, buffer: &mut BufferManager<P>) -> Result<bool> {
        Ok(self.depth_of(buffer, self.root_id)?.is_some())
    }

    /// Depth of the subtree, or None if leaf depths disagree.
    fn depth_of(&self, buffer: &mut BufferManager<P>, page_id: PageId) -> Result<Option<usize>> {
        let frame = buffer.request_page(page_id)?;
        let children = {
            let page = frame.page.borrow();
            if page.is_inner() {
                let count = InnerNode::count(&page);
                (0..=count).map(|i| InnerNode::child_id(&page, i)).collect()
            } else {
                Vec::new()
            }
        };
        buffer.unfix_page(page_id, false);
        if children.is_empty() {
            return Ok(Some(1));
        }
        let mut depth = None;
        for child in children {
            match (self.depth_of(buffer, child)?, depth) {
                (None, _) => return Ok(None),
                (Some(d), None) => depth = Some(d),
                (Some(d), Some(prev)) if d != prev => return Ok(None),
                _ => {}
            }
        }
        Ok(depth.map(|d| d + 1))
    }

    fn is_ordered(&self, buffer: &mut BufferManager<P>) -> Result<bool> {
        self.ordered_rec(buffer, self.root_id, None, None)
    }

    /// Every key in the subtree must be within `[low, high]`. Both ends
    /// are inclusive: duplicate keys may sit on either side of an equal
    /// separator.
    fn ordered_rec(
        &self,
        buffer: &mut BufferManager<P>,
        page_id: PageId,
        low: Option<i64>,
        high: Option<i64>,
    ) -> Result<bool> {
        let frame = buffer.request_page(page_id)?;
        let in_bounds = |k: i64| low.map_or(true, |l| k >= l) && high.map_or(true, |h| k <= h);

        let (keys, children) = {
            let page = frame.page.borrow();
            if page.is_inner() {
                let count = InnerNode::count(&page);
                let keys: Vec<i64> = (0..count).map(|i| InnerNode::key(&page, i)).collect();
                let children: Vec<PageId> =
                    (0..=count).map(|i| InnerNode::child_id(&page, i)).collect();
                (keys, children)
            } else {
                let count = LeafNode::count(&page);
                ((0..count).map(|i| LeafNode::key(&page, i)).collect(), Vec::new())
            }
        };
        buffer.unfix_page(page_id, false);

        if !keys.windows(2).all(|w| w[0] <= w[1]) || !keys.iter().all(|&k| in_bounds(k)) {
            return Ok(false);
        }
        if children.is_empty() {
            return Ok(true);
        }
        for (i, &child) in children.iter().enumerate() {
            let child_low = if i == 0 { low } else { Some(keys[i - 1]) };
            let child_high = if i == keys.len() { high } else { Some(keys[i]) };
            if !self.ordered_rec(buffer, child, child_low, child_high)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn is_concatenated(&self, buffer: &mut BufferManager<P>, expected: usize) -> Result<bool> {
        let mut page_id = self.find_leftmost(buffer, self.root_id)?;
        let mut visited = 0;
        let mut previous: Option<i64> = None;
        while page_id != 0 {
            let frame = buffer.request_page(page_id)?;
            let (sorted, next) = {
                let page = frame.page.borrow();
                let mut sorted = true;
                for i in 0..LeafNode::count(&page) {
                    let key = LeafNode::key(&page, i);
                    if previous.is_some_and(|p| p > key) {
                        sorted = false;
                    }
                    previous = Some(key);
                    visited += 1;
                }
                (sorted, LeafNode::next_leaf(&page))
            };
            buffer.unfix_page(page_id, false);
            if !sorted {
                return Ok(false);
            }
            page_id = next;
        }
        if visited != expected {
            debug!(visited, expected, "leaf chain count mismatch");
            return Ok(false);
        }
        Ok(true)
    }

    fn find_leftmost(&self, buffer: &mut BufferManager<P>, page_id: PageId) -> Result<PageId> {
        let frame = buffer.request_page(page_id)?;
        let next = {
            let page = frame.page.borrow();
            if page.is_inner() {
                Some(InnerNode::child_id(&page, 0))
            } else {
                None
            }
        };
        buffer.unfix_page(page_id, false);
        match next {
            Some(child) => self.find_leftmost(buffer, child),
            None => Ok(page_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageManager;
    use tempfile::TempDir;

    const PAGE_SIZE: usize = 96;

    fn setup(dir: &TempDir) -> (BufferManager<PAGE_SIZE>, BPlusTree<PAGE_SIZE>) {
        let storage = StorageManager::new(dir.path()).unwrap();
        let mut buffer = BufferManager::new(storage, 5);
        let tree = BPlusTree::new(&mut buffer).unwrap();
        (buffer, tree)
    }

    #[test]
    fn insert_and_get_single_leaf() {
        let dir = TempDir::new().unwrap();
        let (mut buffer, mut tree) = setup(&dir);
        tree.insert(&mut buffer, None, 10, 100).unwrap();
        tree.insert(&mut buffer, None, 5, 50).unwrap();
        assert_eq!(tree.get_value(&mut buffer, None, 10).unwrap(), 100);
        assert_eq!(tree.get_value(&mut buffer, None, 5).unwrap(), 50);
        assert_eq!(tree.get_value(&mut buffer, None, 7).unwrap(), ABSENT);
        assert!(tree.validate(&mut buffer, 2).unwrap());
        assert_eq!(buffer.pinned_pages(), 0);
    }

    #[test]
    fn ascending_inserts_split_and_stay_valid() {
        let dir = TempDir::new().unwrap();
        let (mut buffer, mut tree) = setup(&dir);
        for i in 0..64 {
            tree.insert(&mut buffer, None, i, i * 2).unwrap();
        }
        assert!(tree.validate(&mut buffer, 64).unwrap());
        for i in 0..64 {
            assert_eq!(tree.get_value(&mut buffer, None, i).unwrap(), i * 2);
        }
        assert_eq!(buffer.pinned_pages(), 0);
    }

    #[test]
    fn descending_inserts_stay_valid() {
        let dir = TempDir::new().unwrap();
        let (mut buffer, mut tree) = setup(&dir);
        for i in (0..64).rev() {
            tree.insert(&mut buffer, None, i, -i).unwrap();
        }
        assert!(tree.validate(&mut buffer, 64).unwrap());
        for i in 0..64 {
            assert_eq!(tree.get_value(&mut buffer, None, i).unwrap(), -i);
        }
    }

    #[test]
    fn full_signed_range_is_retrievable() {
        let dir = TempDir::new().unwrap();
        let (mut buffer, mut tree) = setup(&dir);
        for i in -20..=20 {
            tree.insert(&mut buffer, None, i, i).unwrap();
        }
        tree.insert(&mut buffer, None, i64::MIN + 1, i64::MIN + 1).unwrap();
        tree.insert(&mut buffer, None, i64::MAX, i64::MAX).unwrap();
        assert_eq!(tree.get_value(&mut buffer, None, i64::MIN + 1).unwrap(), i64::MIN + 1);
        assert_eq!(tree.get_value(&mut buffer, None, i64::MAX).unwrap(), i64::MAX);
        assert!(tree.validate(&mut buffer, 43).unwrap());
        assert_eq!(buffer.pinned_pages(), 0);
    }

    #[test]
    fn repeated_key_keeps_every_entry() {
        let dir = TempDir::new().unwrap();
        let (mut buffer, mut tree) = setup(&dir);
        for _ in 0..20 {
            tree.insert(&mut buffer, None, 1, 1).unwrap();
        }
        assert_eq!(tree.get_value(&mut buffer, None, 1).unwrap(), 1);
        assert!(tree.validate(&mut buffer, 20).unwrap());
    }

    #[test]
    fn delete_collapses_root() {
        let dir = TempDir::new().unwrap();
        let (mut buffer, mut tree) = setup(&dir);
        for i in 1..=5 {
            tree.insert(&mut buffer, None, i * 2, i * 2).unwrap();
        }
        let split_root = tree.root_id();
        tree.delete_value(&mut buffer, None, 4).unwrap();
        tree.delete_value(&mut buffer, None, 6).unwrap();
        // tree shrank back to a single leaf
        assert_ne!(tree.root_id(), split_root);
        for k in [2, 8, 10] {
            assert_eq!(tree.get_value(&mut buffer, None, k).unwrap(), k);
        }
        for k in [4, 6] {
            assert_eq!(tree.get_value(&mut buffer, None, k).unwrap(), ABSENT);
        }
        assert!(tree.validate(&mut buffer, 3).unwrap());
        assert_eq!(buffer.pinned_pages(), 0);
    }

    #[test]
    fn delete_merges_first_leaf_into_right_sibling() {
        let dir = TempDir::new().unwrap();
        let (mut buffer, mut tree) = setup(&dir);
        for i in 1..=7 {
            tree.insert(&mut buffer, None, i * 2, i * 2).unwrap();
        }
        tree.delete_value(&mut buffer, None, 2).unwrap();
        assert_eq!(tree.get_value(&mut buffer, None, 2).unwrap(), ABSENT);
        assert!(tree.validate(&mut buffer, 6).unwrap());
        assert_eq!(buffer.pinned_pages(), 0);
    }

    #[test]
    fn delete_key_that_is_an_inner_separator() {
        let dir = TempDir::new().unwrap();
        let (mut buffer, mut tree) = setup(&dir);
        for i in 0..16 {
            tree.insert(&mut buffer, None, i, i * 10).unwrap();
        }
        // separators live in the inner levels now; delete a handful of
        // keys that are guaranteed to include some of them
        for k in [3, 7, 11, 5] {
            tree.delete_value(&mut buffer, None, k).unwrap();
        }
        assert!(tree.validate(&mut buffer, 12).unwrap());
        for k in [3, 7, 11, 5] {
            assert_eq!(tree.get_value(&mut buffer, None, k).unwrap(), ABSENT);
        }
        assert_eq!(tree.get_value(&mut buffer, None, 4).unwrap(), 40);
    }

    #[test]
    fn delete_absent_key_is_noop() {
        let dir = TempDir::new().unwrap();
        let (mut buffer, mut tree) = setup(&dir);
        for i in 0..8 {
            tree.insert(&mut buffer, None, i, i).unwrap();
        }
        tree.delete_value(&mut buffer, None, 99).unwrap();
        assert!(tree.validate(&mut buffer, 8).unwrap());
    }

    #[test]
    fn drain_completely_and_refill() {
        let dir = TempDir::new().unwrap();
        let (mut buffer, mut tree) = setup(&dir);
        for i in 0..32 {
            tree.insert(&mut buffer, None, i, i).unwrap();
        }
        for i in 0..32 {
            tree.delete_value(&mut buffer, None, i).unwrap();
            assert!(tree.validate(&mut buffer, 31 - i as usize).unwrap());
        }
        for i in 0..32 {
            assert_eq!(tree.get_value(&mut buffer, None, i).unwrap(), ABSENT);
        }
        for i in 0..32 {
            tree.insert(&mut buffer, None, i, i + 1).unwrap();
        }
        assert!(tree.validate(&mut buffer, 32).unwrap());
        assert_eq!(buffer.pinned_pages(), 0);
    }

    #[test]
    fn update_replaces_in_place() {
        let dir = TempDir::new().unwrap();
        let (mut buffer, mut tree) = setup(&dir);
        for i in 0..16 {
            tree.insert(&mut buffer, None, i, i).unwrap();
        }
        tree.update(&mut buffer, None, 9, 900).unwrap();
        assert_eq!(tree.get_value(&mut buffer, None, 9).unwrap(), 900);
        // absent key: no-op
        tree.update(&mut buffer, None, 99, 1).unwrap();
        assert_eq!(tree.get_value(&mut buffer, None, 99).unwrap(), ABSENT);
        assert!(tree.validate(&mut buffer, 16).unwrap());
    }

    #[test]
    fn scan_xors_across_leaves() {
        let dir = TempDir::new().unwrap();
        let (mut buffer, mut tree) = setup(&dir);
        let values = [3, 9, 17, 33, 65, 129, 257, 513];
        for (i, v) in values.iter().enumerate() {
            tree.insert(&mut buffer, None, i as i64, *v).unwrap();
        }
        for start in 0..values.len() {
            for range in 0..=values.len() - start {
                let expected = values[start..start + range].iter().fold(0, |a, v| a ^ v);
                assert_eq!(
                    tree.scan(&mut buffer, None, start as i64, range).unwrap(),
                    expected
                );
            }
        }
        assert_eq!(buffer.pinned_pages(), 0);
    }

    #[test]
    fn scan_longer_than_tail_stops_at_end() {
        let dir = TempDir::new().unwrap();
        let (mut buffer, mut tree) = setup(&dir);
        for i in 0..6 {
            tree.insert(&mut buffer, None, i, 1 << i).unwrap();
        }
        let expected = (0..6).fold(0i64, |a, i| a ^ (1 << i));
        assert_eq!(tree.scan(&mut buffer, None, 0, 100).unwrap(), expected);
    }

    #[test]
    fn scan_missing_start_key_is_absent() {
        let dir = TempDir::new().unwrap();
        let (mut buffer, mut tree) = setup(&dir);
        for i in 0..6 {
            tree.insert(&mut buffer, None, i * 2, i).unwrap();
        }
        assert_eq!(tree.scan(&mut buffer, None, 5, 3).unwrap(), ABSENT);
    }

    #[test]
    fn scan_sentinel_collision_is_escaped() {
        let dir = TempDir::new().unwrap();
        let (mut buffer, mut tree) = setup(&dir);
        tree.insert(&mut buffer, None, 1, i64::MIN + 1).unwrap();
        tree.insert(&mut buffer, None, 2, 1).unwrap();
        // (MIN + 1) ^ 1 == MIN
        assert_eq!(tree.scan(&mut buffer, None, 1, 2).unwrap(), i64::MIN + 1);
    }

    #[test]
    fn interleaved_inserts_and_deletes_stay_valid() {
        let dir = TempDir::new().unwrap();
        let (mut buffer, mut tree) = setup(&dir);
        let mut live = 0usize;
        for round in 0..8i64 {
            for i in 0..12 {
                tree.insert(&mut buffer, None, round * 100 + i, i).unwrap();
                live += 1;
            }
            for i in 0..6 {
                tree.delete_value(&mut buffer, None, round * 100 + i * 2).unwrap();
                live -= 1;
            }
            assert!(tree.validate(&mut buffer, live).unwrap());
            assert_eq!(buffer.pinned_pages(), 0);
        }
    }
}
