//! Adaptive radix tree cache in front of the B+-tree. Keys are the 8
//! bytes of the integer key, most significant byte first; paths are
//! compressed (a node stores the full key of one descendant as a prefix
//! witness) and single-key suffixes are expanded lazily. Each cached
//! entry is a back-reference into a B+-tree leaf page, validated on
//! every read against the page id it was captured with; stale entries
//! are evicted lazily and the read falls through to the tree.

mod node;

use std::mem;
use std::rc::Weak;
use tracing::debug;

use crate::btree::node::LeafNode;
use crate::storage::{Frame, PageId};
use crate::ABSENT;
use node::{Child, LeafFrame, Node, Node256, Node4, Node48};

enum Probe {
    Absent,
    Hit(i64),
    Stale,
}

enum Outcome {
    Intact,
    Emptied,
}

pub struct RadixTree<const P: usize> {
    root: Option<Box<Node<P>>>,
    /// Byte budget; inserts that could push `bytes` past it are dropped.
    budget: usize,
    /// Bytes currently allocated for nodes and frames.
    bytes: usize,
}

impl<const P: usize> RadixTree<P> {
    const FRAME_BYTES: usize = mem::size_of::<LeafFrame<P>>();

    pub fn new(budget: usize) -> Self {
        Self { root: None, budget, bytes: 0 }
    }

    /// Current allocation of the cache in bytes.
    pub fn current_size(&self) -> usize {
        self.bytes
    }

    /// Cache `key` as living on leaf page `page_id`. An existing entry is
    /// refreshed in place; otherwise the path down to depth 8 is created,
    /// splitting compressed prefixes and promoting full nodes as needed.
    pub fn insert(&mut self, key: i64, page_id: PageId, page: Weak<Frame<P>>) {
        if self.bytes + Self::insert_headroom() > self.budget {
            debug!(key, "cache budget exhausted, dropping insert");
            return;
        }
        match &mut self.root {
            None => {
                let mut leaf = Box::new(Node::new_leaf(key));
                leaf.add(Self::byte_at(key, 8), Child::Frame(LeafFrame { page_id, page }));
                self.bytes += leaf.footprint() + Self::FRAME_BYTES;
                self.root = Some(leaf);
            }
            Some(root) => {
                let lcp = Self::common_prefix(root.key, key);
                if lcp + 1 < root.depth {
                    // the key leaves the compressed path above the root
                    let old = self.root.take().expect("root vanished");
                    let mut split = Box::new(Node::new_inner(lcp + 1, key));
                    split.add(Self::byte_at(old.key, lcp + 1), Child::Node(old));
                    let leaf = Self::new_leaf_path(key, page_id, page, &mut self.bytes);
                    split.add(Self::byte_at(key, lcp + 1), Child::Node(leaf));
                    self.bytes += split.footprint();
                    self.root = Some(split);
                } else {
                    Self::insert_rec(root, key, page_id, page, &mut self.bytes);
                }
            }
        }
    }

    /// Look `key` up through the cache. Returns the value read from the
    /// referenced leaf page when the entry is still valid, the absent
    /// sentinel otherwise; an invalid entry deletes itself on the way out.
    pub fn get_value(&mut self, key: i64) -> i64 {
        match self.probe(key) {
            Probe::Hit(value) => value,
            Probe::Absent => ABSENT,
            Probe::Stale => {
                debug!(key, "stale cache entry, evicting");
                self.delete_reference(key);
                ABSENT
            }
        }
    }

    /// Drop the entry for `key` if present, demoting oversized nodes and
    /// restoring path compression where a single subtree remains.
    pub fn delete_reference(&mut self, key: i64) {
        let Some(root) = self.root.as_deref_mut() else {
            return;
        };
        if let Outcome::Emptied = Self::delete_rec(root, key, &mut self.bytes) {
            let old = self.root.take().expect("root vanished");
            self.bytes -= old.footprint();
        }
    }

    /// Redirect every cached entry with a key in `[from, to]` to the leaf
    /// page `page_id`. Used by the tree when a split or merge migrates a
    /// key range to another page.
    pub fn update_range(&mut self, from: i64, to: i64, page_id: PageId, page: Weak<Frame<P>>) {
        if let Some(root) = self.root.as_deref_mut() {
            Self::update_range_rec(root, from, to, page_id, &page);
        }
    }

    /// Drop every node and frame.
    pub fn destroy(&mut self) {
        self.root = None;
        self.bytes = 0;
    }

    /// Structural invariants: leaves sit at depth 8, inner nodes hold at
    /// least two children, and every child agrees with its parent's
    /// compressed prefix and slot byte.
    pub fn validate(&self) -> bool {
        match &self.root {
            None => true,
            Some(root) => Self::validate_rec(root),
        }
    }

    /// Byte at 1-based `depth`, most significant first, reinterpreted
    /// unsigned so the byte order is total.
    fn byte_at(key: i64, depth: u8) -> u8 {
        ((key as u64) >> ((8 - depth as u32) * 8)) as u8
    }

    /// Shared leading bytes of two keys, capped at 7: the final byte is
    /// always resolved inside a leaf node.
    fn common_prefix(a: i64, b: i64) -> u8 {
        let mut prefix = 0;
        for depth in 1..=8 {
            if Self::byte_at(a, depth) == Self::byte_at(b, depth) && prefix < 7 {
                prefix += 1;
            } else {
                break;
            }
        }
        prefix
    }

    /// The key's leading `depth` bytes as a signed number (arithmetic
    /// shift keeps the sign), comparable across keys at equal depth.
    fn prefix_through(key: i64, depth: u8) -> i64 {
        key >> ((8 - depth as u32) * 8)
    }

    /// Prefix of the child stored under `byte` in a node at `depth` whose
    /// witness key is `node_key`. At depth 1 the witness contributes
    /// nothing and the byte alone decides, sign included.
    fn child_prefix(node_key: i64, byte: u8, depth: u8) -> i64 {
        if depth == 1 {
            byte as i8 as i64
        } else {
            (Self::prefix_through(node_key, depth) & !0xFF) | byte as i64
        }
    }

    /// Worst case one insert can allocate: a prefix split (inner node
    /// plus leaf node plus frame) on top of one promotion to N256.
    fn insert_headroom() -> usize {
        let node = mem::size_of::<Node<P>>();
        let n4 = node + mem::size_of::<Node4<P>>();
        2 * n4 + Self::FRAME_BYTES + (mem::size_of::<Node256<P>>() - mem::size_of::<Node48<P>>())
    }

    /// A lazily-expanded path: one leaf node at depth 8 holding the
    /// frame, covering the whole remaining suffix of `key`.
    fn new_leaf_path(
        key: i64,
        page_id: PageId,
        page: Weak<Frame<P>>,
        bytes: &mut usize,
    ) -> Box<Node<P>> {
        let mut leaf = Box::new(Node::new_leaf(key));
        leaf.add(Self::byte_at(key, 8), Child::Frame(LeafFrame { page_id, page }));
        *bytes += leaf.footprint() + Self::FRAME_BYTES;
        leaf
    }

    fn insert_rec(
        node: &mut Node<P>,
        key: i64,
        page_id: PageId,
        page: Weak<Frame<P>>,
        bytes: &mut usize,
    ) {
        let byte = Self::byte_at(key, node.depth);
        if node.leaf {
            if let Some(Child::Frame(frame)) = node.child_mut(byte) {
                frame.page_id = page_id;
                frame.page = page;
                return;
            }
            Self::grow_if_full(node, bytes);
            node.add(byte, Child::Frame(LeafFrame { page_id, page }));
            *bytes += Self::FRAME_BYTES;
            return;
        }

        if !node.has_child(byte) {
            Self::grow_if_full(node, bytes);
            let leaf = Self::new_leaf_path(key, page_id, page, bytes);
            node.add(byte, Child::Node(leaf));
            return;
        }

        let (child_key, child_depth) = match node.child(byte) {
            Some(Child::Node(child)) => (child.key, child.depth),
            _ => unreachable!("inner cache node holds node children"),
        };
        let lcp = Self::common_prefix(child_key, key);
        if lcp + 1 < child_depth {
            // the key diverges inside the child's compressed prefix
            let old = node.remove_child(byte).expect("child byte vanished");
            let mut split = Box::new(Node::new_inner(lcp + 1, key));
            split.add(Self::byte_at(child_key, lcp + 1), old);
            let leaf = Self::new_leaf_path(key, page_id, page, bytes);
            split.add(Self::byte_at(key, lcp + 1), Child::Node(leaf));
            *bytes += split.footprint();
            node.add(byte, Child::Node(split));
        } else {
            match node.child_mut(byte) {
                Some(Child::Node(child)) => Self::insert_rec(child, key, page_id, page, bytes),
                _ => unreachable!("inner cache node holds node children"),
            }
        }
    }

    fn grow_if_full(node: &mut Node<P>, bytes: &mut usize) {
        if !node.can_insert() {
            let before = node.footprint();
            node.grow();
            *bytes += node.footprint() - before;
        }
    }

    fn probe(&self, key: i64) -> Probe {
        let mut node = match &self.root {
            Some(root) => root.as_ref(),
            None => return Probe::Absent,
        };
        loop {
            let byte = Self::byte_at(key, node.depth);
            match node.child(byte) {
                None => return Probe::Absent,
                Some(Child::Node(child)) => node = &**child,
                Some(Child::Frame(frame)) => {
                    if let Some(resident) = frame.page.upgrade() {
                        let page = resident.page.borrow();
                        if page.page_id() == frame.page_id && !page.is_inner() {
                            return Probe::Hit(LeafNode::get(&page, key));
                        }
                    }
                    return Probe::Stale;
                }
            }
        }
    }

    fn delete_rec(node: &mut Node<P>, key: i64, bytes: &mut usize) -> Outcome {
        let byte = Self::byte_at(key, node.depth);
        if node.leaf {
            match node.remove_child(byte) {
                None => return Outcome::Intact,
                Some(Child::Frame(_)) => *bytes -= Self::FRAME_BYTES,
                Some(Child::Node(_)) => unreachable!("leaf cache node holds frame children"),
            }
            if node.count == 0 {
                return Outcome::Emptied;
            }
            Self::demote_if_oversized(node, bytes);
            return Outcome::Intact;
        }

        let outcome = match node.child_mut(byte) {
            None => return Outcome::Intact,
            Some(Child::Node(child)) => Self::delete_rec(child, key, bytes),
            Some(Child::Frame(_)) => unreachable!("inner cache node holds node children"),
        };
        if let Outcome::Emptied = outcome {
            let removed = node.remove_child(byte).expect("emptied child vanished");
            if let Child::Node(child) = &removed {
                *bytes -= child.footprint();
            }
            if node.count == 0 {
                return Outcome::Emptied;
            }
            if node.count == 1 {
                // one subtree left: splice it up to restore compression
                match node.take_single_child() {
                    Child::Node(child) => {
                        *bytes -= node.footprint();
                        *node = *child;
                    }
                    Child::Frame(_) => unreachable!("inner cache node holds node children"),
                }
                return Outcome::Intact;
            }
            Self::demote_if_oversized(node, bytes);
        }
        Outcome::Intact
    }

    fn demote_if_oversized(node: &mut Node<P>, bytes: &mut usize) {
        if node.should_demote() {
            let before = node.footprint();
            node.demote();
            *bytes -= before - node.footprint();
        }
    }

    fn update_range_rec(
        node: &mut Node<P>,
        from: i64,
        to: i64,
        page_id: PageId,
        page: &Weak<Frame<P>>,
    ) {
        let depth = node.depth;
        let node_key = node.key;
        let bytes: Vec<u8> = node.child_bytes().collect();
        for byte in bytes {
            let in_range = if depth == 1 && from < 0 && to >= 0 {
                // the range wraps at zero: [from, 0xFF] plus [0x00, to]
                byte >= Self::byte_at(from, 1) || byte <= Self::byte_at(to, 1)
            } else {
                let prefix = Self::child_prefix(node_key, byte, depth);
                prefix >= Self::prefix_through(from, depth)
                    && prefix <= Self::prefix_through(to, depth)
            };
            if !in_range {
                continue;
            }
            match node.child_mut(byte).expect("child byte vanished") {
                Child::Frame(frame) => {
                    frame.page_id = page_id;
                    frame.page = page.clone();
                }
                Child::Node(child) => Self::update_range_rec(child, from, to, page_id, page),
            }
        }
    }

    fn validate_rec(node: &Node<P>) -> bool {
        if node.leaf {
            return node.depth == 8 && node.count >= 1;
        }
        if node.count < 2 {
            return false;
        }
        node.child_bytes().all(|byte| match node.child(byte) {
            Some(Child::Node(child)) => {
                Self::byte_at(child.key, node.depth) == byte
                    && Self::common_prefix(node.key, child.key) >= node.depth - 1
                    && child.depth > node.depth
                    && Self::validate_rec(child)
            }
            _ => false,
        })
    }
}
