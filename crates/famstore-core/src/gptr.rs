//! Global pointers into shared memory pools
//!
//! A [`Gptr`] names a block inside a pool by pool id and word offset, so it
//! stays meaningful in every process that maps the pool, whatever the local
//! virtual address. A [`TagGptr`] adds a 64-bit version tag.
//!
//! Packed pointer layout (most significant bit first):
//!
//! ```text
//! Gptr: [ 24 unused | pool: 8 | offset: 32 ]
//! ```
//!
//! Offsets are in 8-byte words. Offset 0 is reserved in every pool, so an
//! all-zero word is the null pointer. The radix tree keeps only the low bits
//! of a tag in its value slot and recovers the rest from a per-node tag
//! watermark (see `radix_tree`).

use std::fmt;

const OFFSET_BITS: u32 = 32;
const POOL_BITS: u32 = 8;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;
const POOL_MASK: u64 = (1 << POOL_BITS) - 1;

/// Identifier of a memory pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PoolId(pub u8);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool-{}", self.0)
    }
}

/// Location-independent reference to a block inside a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Gptr {
    pool: PoolId,
    offset: u32,
}

impl Gptr {
    /// The null pointer.
    pub const NULL: Gptr = Gptr { pool: PoolId(0), offset: 0 };

    /// Null pointer marking a value slot whose node is being unlinked.
    pub(crate) const REMOVED: Gptr = Gptr { pool: PoolId(u8::MAX), offset: 0 };

    /// Only the heap mints pointers; everything else copies them around.
    pub(crate) fn new(pool: PoolId, offset: u32) -> Self {
        Self { pool, offset }
    }

    /// Pool this pointer refers into.
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    /// Word offset inside the pool.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn is_null(&self) -> bool {
        self.offset == 0
    }

    /// Pack into a u64 for storage in a pool word.
    pub fn to_word(self) -> u64 {
        ((self.pool.0 as u64) << OFFSET_BITS) | self.offset as u64
    }

    /// Unpack from a pool word.
    pub fn from_word(word: u64) -> Self {
        Self {
            pool: PoolId(((word >> OFFSET_BITS) & POOL_MASK) as u8),
            offset: (word & OFFSET_MASK) as u32,
        }
    }
}

impl fmt::Display for Gptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.pool.0, self.offset)
    }
}

/// A [`Gptr`] plus a version tag.
///
/// Equal pointer with unequal tag means "same slot, possibly different
/// content". Equal pointer and equal tag means the cached content is current
/// as of the read that produced it. Tags of one slot only ever grow, and at
/// 64 bits they do not wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TagGptr {
    ptr: Gptr,
    tag: u64,
}

impl TagGptr {
    /// Null pointer with tag 0; the state of a never-written value slot.
    pub const NULL: TagGptr = TagGptr { ptr: Gptr::NULL, tag: 0 };

    pub fn new(ptr: Gptr, tag: u64) -> Self {
        Self { ptr, tag }
    }

    pub fn gptr(&self) -> Gptr {
        self.ptr
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// True when the slot holds no value (the tag may still be non-zero).
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// True when the slot belongs to a node that a delete is unlinking.
    pub fn is_removed(&self) -> bool {
        self.ptr == Gptr::REMOVED
    }

    /// Successor handle pointing at `ptr`: the tag advances by one.
    pub fn successor(&self, ptr: Gptr) -> Self {
        Self::new(ptr, self.tag + 1)
    }
}

impl fmt::Display for TagGptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.gptr(), self.tag())
    }
}
