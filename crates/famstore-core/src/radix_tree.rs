//! Lock-free radix tree laid out in a shared memory pool
//!
//! Every node stores the full key prefix it represents, a value slot and 256
//! child pointers indexed by the next key byte. A node's prefix never changes
//! once the node is reachable. Structure grows by CAS on a child slot:
//!
//! - a missing child is filled with a fresh leaf node;
//! - a child whose prefix diverges from the key is replaced by a new
//!   intermediate node holding the common prefix, with the old child and the
//!   new leaf hung below it.
//!
//! A failed CAS frees the speculative nodes (nobody else saw them) and retries
//! from the same parent.
//!
//! Structure shrinks through [`RadixTree::prune`]. A node with an empty value
//! slot and at most one child is claimed by swinging its value slot to the
//! removed marker, then every child slot is frozen with a high bit so no
//! insert can land below it. The parent's slot is then swung from the node to
//! its only child (or to null) and the node is retired. Inserters that meet a
//! frozen slot, and writers that meet a removed value slot, start over from
//! the root. A node with two or more children gives up the claim and thaws.
//!
//! Value slots hold a pointer and the low 24 bits of the version tag in one
//! word. The full tag is recovered from a per-node watermark, raised after
//! every successful slot CAS. Epoch slots are capped at 4096, so fewer than
//! 2^12 installs can be in flight between a CAS and its watermark update and
//! the recovered tag is exact.
//!
//! Node layout (words):
//!   [0]        magic << 32 | prefix length
//!   [1..=5]    prefix bytes (40 max)
//!   [6]        value slot (tag low bits << 40 | Gptr)
//!   [7..263]   children (Gptr, bit 63 = frozen)
//!   [263]      tag watermark
//!
//! All traversals take an [`EpochOp`] to prove they run inside an epoch.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::thread;

use tracing::debug;

use crate::config::MAX_KEY_LEN;
use crate::epoch::EpochOp;
use crate::error::{EngineError, EngineResult};
use crate::gptr::{Gptr, TagGptr};
use crate::heap::{Heap, WORD_BYTES};

const NODE_MAGIC: u64 = 0x5258_4E44; // "RXND"
const NODE_HEADER: usize = 0;
const NODE_PREFIX: usize = 1;
const NODE_VALUE: usize = NODE_PREFIX + MAX_KEY_LEN / WORD_BYTES;
const NODE_CHILDREN: usize = NODE_VALUE + 1;
const FANOUT: usize = 256;
const NODE_TAG: usize = NODE_CHILDREN + FANOUT;
const NODE_WORDS: usize = NODE_TAG + 1;

/// Child slot bit set while the owning node is being unlinked.
const FROZEN: u64 = 1 << 63;

const SLOT_TAG_SHIFT: u32 = 40;
const SLOT_TAG_MASK: u64 = (1 << 24) - 1;

/// Largest watermark movement across one slot read that still pins the tag.
const TAG_WINDOW: u64 = 1 << 23;

fn pack_slot(value: TagGptr) -> u64 {
    ((value.tag() & SLOT_TAG_MASK) << SLOT_TAG_SHIFT) | value.gptr().to_word()
}

/// Rebuild a full tag from slot bits and a watermark it cannot be below.
fn unpack_slot(word: u64, floor: u64) -> TagGptr {
    let low = word >> SLOT_TAG_SHIFT;
    let tag = floor + (low.wrapping_sub(floor) & SLOT_TAG_MASK);
    TagGptr::new(Gptr::from_word(word), tag)
}

/// Lower bound of an ordered seek: the key and whether it is inclusive.
pub type LowerBound<'a> = Option<(&'a [u8], bool)>;

/// A node found by an ordered seek.
#[derive(Debug, Clone)]
pub struct SeekHit {
    /// Full key of the node
    pub key: Vec<u8>,
    /// The node itself
    pub node: Gptr,
    /// Value slot contents at the time of the visit (never null)
    pub value: TagGptr,
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Radix tree rooted at a node inside `heap`.
pub struct RadixTree {
    heap: Arc<Heap>,
    root: Gptr,
}

impl RadixTree {
    /// Build an empty tree with a fresh root node.
    pub fn create(heap: Arc<Heap>) -> EngineResult<Self> {
        let root = alloc_node(&heap, &[])?;
        Ok(Self { heap, root })
    }

    /// Attach to an existing tree.
    pub fn open(heap: Arc<Heap>, root: Gptr) -> EngineResult<Self> {
        let tree = Self { heap, root };
        tree.validate_node(root)?;
        if tree.prefix_len(root) != 0 {
            return Err(EngineError::InvalidPointer {
                ptr: root,
                reason: "node is not a tree root",
            });
        }
        Ok(tree)
    }

    pub fn root(&self) -> Gptr {
        self.root
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Check that `ptr` references a tree node in this pool.
    pub fn validate_node(&self, ptr: Gptr) -> EngineResult<()> {
        let invalid = |reason| EngineError::InvalidPointer { ptr, reason };
        if ptr.is_null() {
            return Err(invalid("null pointer"));
        }
        if ptr.pool() != self.heap.pool_id() {
            return Err(invalid("pointer into a different pool"));
        }
        match self.heap.block_class(ptr) {
            Some(class) if class as usize >= NODE_WORDS => {}
            _ => return Err(invalid("not a live heap block")),
        }
        if self.heap.load(ptr, NODE_HEADER) >> 32 != NODE_MAGIC {
            return Err(invalid("block is not a tree node"));
        }
        Ok(())
    }

    fn prefix_len(&self, node: Gptr) -> usize {
        (self.heap.load(node, NODE_HEADER) & 0xFFFF_FFFF) as usize
    }

    fn prefix(&self, node: Gptr) -> Vec<u8> {
        let len = self.prefix_len(node);
        self.heap.read_bytes(node, NODE_PREFIX, len)
    }

    fn child(&self, node: Gptr, byte: u8) -> Gptr {
        Gptr::from_word(self.heap.load(node, NODE_CHILDREN + byte as usize))
    }

    /// Current contents of a node's value slot.
    pub fn value(&self, node: Gptr) -> TagGptr {
        loop {
            let before = self.heap.load(node, NODE_TAG);
            let word = self.heap.load(node, NODE_VALUE);
            let after = self.heap.load(node, NODE_TAG);
            if after - before < TAG_WINDOW {
                return unpack_slot(word, before);
            }
        }
    }

    /// Swap a node's value slot from `current` to `new`.
    ///
    /// On failure returns the slot's actual contents. A `current` older than
    /// the node's watermark fails even when its low tag bits line up.
    pub fn cas_value(&self, node: Gptr, current: TagGptr, new: TagGptr) -> Result<(), TagGptr> {
        if current.tag() < self.heap.load(node, NODE_TAG) {
            return Err(self.value(node));
        }
        match self.heap.compare_exchange(node, NODE_VALUE, pack_slot(current), pack_slot(new)) {
            Ok(_) => {
                self.heap.fetch_max(node, NODE_TAG, new.tag());
                Ok(())
            }
            Err(_) => Err(self.value(node)),
        }
    }

    /// Find the node whose prefix equals `key`, if it exists.
    ///
    /// The node may have an empty value slot.
    pub fn lookup(&self, key: &[u8], _op: &EpochOp<'_>) -> Option<Gptr> {
        let mut node = self.root;
        loop {
            let depth = self.prefix_len(node);
            if depth == key.len() {
                return Some(node);
            }
            let child = self.child(node, key[depth]);
            if child.is_null() {
                return None;
            }
            let prefix = self.prefix(child);
            if prefix.len() > key.len() || key[..prefix.len()] != prefix[..] {
                return None;
            }
            node = child;
        }
    }

    /// Find the node for `key`, creating it (and splitting a path) if needed.
    ///
    /// On allocation failure nothing new is reachable from the root. The
    /// returned node may be mid-prune; callers that see a removed value slot
    /// call again.
    pub fn find_or_insert(&self, key: &[u8], _op: &EpochOp<'_>) -> EngineResult<Gptr> {
        let mut node = self.root;
        loop {
            let depth = self.prefix_len(node);
            if depth == key.len() {
                return Ok(node);
            }
            let slot = NODE_CHILDREN + key[depth] as usize;
            let word = self.heap.load(node, slot);
            if word & FROZEN != 0 {
                // `node` is being unlinked; its subtree moves up
                std::hint::spin_loop();
                node = self.root;
                continue;
            }
            let child = Gptr::from_word(word);

            if child.is_null() {
                let leaf = alloc_node(&self.heap, key)?;
                match self.heap.compare_exchange(node, slot, 0, leaf.to_word()) {
                    Ok(_) => return Ok(leaf),
                    Err(_) => {
                        self.heap.free(leaf);
                        continue;
                    }
                }
            }

            let child_prefix = self.prefix(child);
            let common = common_prefix_len(&child_prefix, key);
            if common == child_prefix.len() {
                node = child;
                continue;
            }

            // Split: child and key diverge (or key ends) at `common`
            let mid = alloc_node(&self.heap, &key[..common])?;
            self.heap.store(mid, NODE_CHILDREN + child_prefix[common] as usize, child.to_word());
            let target = if common == key.len() {
                mid
            } else {
                match alloc_node(&self.heap, key) {
                    Ok(leaf) => {
                        self.heap.store(mid, NODE_CHILDREN + key[common] as usize, leaf.to_word());
                        leaf
                    }
                    Err(e) => {
                        self.heap.free(mid);
                        return Err(e);
                    }
                }
            };

            match self.heap.compare_exchange(node, slot, child.to_word(), mid.to_word()) {
                Ok(_) => return Ok(target),
                Err(_) => {
                    if target != mid {
                        self.heap.free(target);
                    }
                    self.heap.free(mid);
                }
            }
        }
    }

    /// Unlink `node` and then any ancestors left without a value and with a
    /// single child, stopping at the first node that must stay.
    ///
    /// Returns the number of nodes retired.
    pub fn prune(&self, node: Gptr, _op: &EpochOp<'_>) -> usize {
        let mut node = node;
        let mut retired = 0;
        while node != self.root {
            match self.try_unlink(node) {
                Some(parent) => {
                    retired += 1;
                    node = parent;
                }
                None => break,
            }
        }
        retired
    }

    /// Remove one node if it holds no value and at most one child, returning
    /// the parent it was unlinked from.
    fn try_unlink(&self, node: Gptr) -> Option<Gptr> {
        let occupied = (0..FANOUT).filter(|&b| !self.child(node, b as u8).is_null()).count();
        if occupied > 1 {
            return None;
        }
        let current = self.value(node);
        if !current.is_null() || current.is_removed() {
            return None;
        }
        let claimed = current.successor(Gptr::REMOVED);
        self.cas_value(node, current, claimed).ok()?;

        let mut survivor = 0u64;
        let mut children = 0;
        for byte in 0..FANOUT {
            let slot = NODE_CHILDREN + byte;
            let mut word = self.heap.load(node, slot);
            while let Err(actual) = self.heap.compare_exchange(node, slot, word, word | FROZEN) {
                word = actual;
            }
            if !Gptr::from_word(word).is_null() {
                children += 1;
                survivor = word;
            }
        }
        if children > 1 {
            self.thaw(node, claimed);
            return None;
        }

        let parent = self.replace_in_parent(node, survivor)?;
        self.heap.retire(node);
        Some(parent)
    }

    /// Undo a claim on a node that turned out to have several children.
    fn thaw(&self, node: Gptr, claimed: TagGptr) {
        for byte in 0..FANOUT {
            let slot = NODE_CHILDREN + byte;
            let word = self.heap.load(node, slot);
            self.heap.store(node, slot, word & !FROZEN);
        }
        // Only the claimant writes a removed slot
        let _ = self.cas_value(node, claimed, claimed.successor(Gptr::NULL));
    }

    /// Swing the parent slot holding `node` to `replacement`.
    fn replace_in_parent(&self, node: Gptr, replacement: u64) -> Option<Gptr> {
        let prefix = self.prefix(node);
        loop {
            let Some((parent, slot)) = self.find_parent(node, &prefix) else {
                debug!(%node, "claimed node is no longer reachable");
                return None;
            };
            let word = self.heap.load(parent, slot);
            if word & FROZEN != 0 {
                // The parent is being unlinked and will hand `node` up
                thread::yield_now();
                continue;
            }
            if word != node.to_word() {
                continue;
            }
            if self.heap.compare_exchange(parent, slot, word, replacement).is_ok() {
                return Some(parent);
            }
        }
    }

    /// Walk `prefix` from the root to the node whose child slot holds `node`.
    fn find_parent(&self, node: Gptr, prefix: &[u8]) -> Option<(Gptr, usize)> {
        let mut current = self.root;
        loop {
            let depth = self.prefix_len(current);
            if depth >= prefix.len() {
                return None;
            }
            let slot = NODE_CHILDREN + prefix[depth] as usize;
            let child = Gptr::from_word(self.heap.load(current, slot));
            if child == node {
                return Some((current, slot));
            }
            if child.is_null() {
                return None;
            }
            let child_prefix = self.prefix(child);
            if child_prefix.len() >= prefix.len() || !prefix.starts_with(&child_prefix) {
                return None;
            }
            current = child;
        }
    }

    /// Smallest key holding a value that satisfies `lower`.
    pub fn seek(&self, lower: LowerBound<'_>, _op: &EpochOp<'_>) -> Option<SeekHit> {
        self.seek_from(self.root, lower)
    }

    fn seek_from(&self, node: Gptr, lower: LowerBound<'_>) -> Option<SeekHit> {
        let prefix = self.prefix(node);

        // Which parts of this subtree can satisfy the bound
        let mut include_self = true;
        let mut bounded_child: Option<(u8, LowerBound<'_>)> = None;
        let mut first_free_child = 0usize;

        if let Some((bound, inclusive)) = lower {
            let l = prefix.len().min(bound.len());
            match prefix[..l].cmp(&bound[..l]) {
                CmpOrdering::Less => return None,
                CmpOrdering::Greater => {}
                CmpOrdering::Equal => match prefix.len().cmp(&bound.len()) {
                    // prefix extends the bound: everything here sorts after it
                    CmpOrdering::Greater => {}
                    CmpOrdering::Equal => include_self = inclusive,
                    CmpOrdering::Less => {
                        include_self = false;
                        let next = bound[prefix.len()];
                        bounded_child = Some((next, lower));
                        first_free_child = next as usize + 1;
                    }
                },
            }
        }

        if include_self {
            let value = self.value(node);
            if !value.is_null() {
                return Some(SeekHit { key: prefix, node, value });
            }
        }

        if let Some((byte, bound)) = bounded_child {
            let child = self.child(node, byte);
            if !child.is_null() {
                if let Some(hit) = self.seek_from(child, bound) {
                    return Some(hit);
                }
            }
        }

        for byte in first_free_child..FANOUT {
            let child = self.child(node, byte as u8);
            if !child.is_null() {
                if let Some(hit) = self.seek_from(child, None) {
                    return Some(hit);
                }
            }
        }
        None
    }
}

/// Allocate a node for `prefix` with an empty value slot and no children.
fn alloc_node(heap: &Heap, prefix: &[u8]) -> EngineResult<Gptr> {
    debug_assert!(prefix.len() <= MAX_KEY_LEN);
    let node = heap.alloc(NODE_WORDS * WORD_BYTES)?;
    heap.write_bytes(node, NODE_PREFIX, prefix);
    heap.store(node, NODE_HEADER, (NODE_MAGIC << 32) | prefix.len() as u64);
    Ok(node)
}
