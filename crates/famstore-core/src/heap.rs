//! Shared memory pools and the block allocator
//!
//! A [`Heap`] is one pool of 64-bit words. Blocks are carved out of it with a
//! bump pointer and recycled through size-class free lists. Every block is
//! preceded by a header word carrying a magic tag and the block's size class,
//! which lets the heap validate pointers handed back by callers.
//!
//! Memory is committed in fixed-size segments the first time the bump
//! pointer reaches them, so a large pool costs nothing until it fills.
//!
//! Freeing comes in two flavours:
//! - [`Heap::free`] returns a block immediately. Only for blocks that were
//!   never published where another thread could see them.
//! - [`Heap::retire`] defers the free until the epoch manager reports that no
//!   in-flight operation could still hold the pointer.
//!
//! A [`MemoryManager`] owns pools by id so several engines can attach to the
//! same pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::epoch::{EpochManager, EpochOp};
use crate::error::{EngineError, EngineResult};
use crate::gptr::{Gptr, PoolId};

/// Bytes per pool word
pub const WORD_BYTES: usize = 8;

/// Magic tag stored in the upper half of every block header
const BLOCK_MAGIC: u64 = 0xFA5B_10C0;

/// Blocks up to this many words use linear size classes
const LINEAR_CLASS_LIMIT: u32 = 512;

/// Granularity of the linear size classes (words)
const LINEAR_CLASS_STEP: u32 = 8;

/// Words per lazily committed segment (8MB)
const SEGMENT_WORDS: usize = 1 << 20;

/// Round a payload size (words) up to its size class.
fn size_class(words: u32) -> u32 {
    let words = words.max(1);
    if words <= LINEAR_CLASS_LIMIT {
        words.div_ceil(LINEAR_CLASS_STEP) * LINEAR_CLASS_STEP
    } else {
        words.next_power_of_two()
    }
}

fn header_word(class: u32) -> u64 {
    (BLOCK_MAGIC << 32) | class as u64
}

/// A block waiting for its epoch to drain.
#[derive(Debug, Clone, Copy)]
struct Retired {
    ptr: Gptr,
    epoch: u64,
}

/// Allocator bookkeeping, guarded by one mutex.
struct AllocState {
    /// Next unused word (bump pointer)
    next: u64,
    /// Free blocks by size class
    free: HashMap<u32, Vec<u32>>,
}

/// Counters describing pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Pool capacity in bytes
    pub capacity_bytes: u64,
    /// Bytes backed by committed segments
    pub committed_bytes: u64,
    /// Bytes in live blocks (headers included)
    pub used_bytes: u64,
    /// Blocks waiting for reclamation
    pub retired_blocks: usize,
    /// Blocks returned to the free lists by reclamation so far
    pub reclaimed_blocks: u64,
}

/// One memory pool with an allocator and an epoch manager.
pub struct Heap {
    pool_id: PoolId,
    n_words: usize,
    segments: Box<[OnceLock<Box<[AtomicU64]>>]>,
    committed_words: AtomicU64,
    alloc: Mutex<AllocState>,
    retired: Mutex<Vec<Retired>>,
    epochs: EpochManager,
    retire_batch: usize,
    used_words: AtomicU64,
    reclaimed: AtomicU64,
}

impl Heap {
    /// Create a zeroed pool of `size_bytes` (rounded down to whole words).
    pub fn new(pool_id: PoolId, size_bytes: u64, epoch_slots: usize, retire_batch: usize) -> Self {
        let n_words = (size_bytes / WORD_BYTES as u64).min(u32::MAX as u64) as usize;
        Self {
            pool_id,
            n_words,
            segments: (0..n_words.div_ceil(SEGMENT_WORDS)).map(|_| OnceLock::new()).collect(),
            committed_words: AtomicU64::new(0),
            // Word 0 is reserved so offset 0 can be the null pointer
            alloc: Mutex::new(AllocState { next: 1, free: HashMap::new() }),
            retired: Mutex::new(Vec::new()),
            epochs: EpochManager::new(epoch_slots),
            retire_batch: retire_batch.max(1),
            used_words: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        }
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// The pool's epoch manager.
    pub fn epochs(&self) -> &EpochManager {
        &self.epochs
    }

    /// Begin an epoch operation on this pool.
    pub fn enter(&self) -> EpochOp<'_> {
        self.epochs.enter()
    }

    /// Allocate a zero-filled block of at least `bytes` bytes.
    pub fn alloc(&self, bytes: usize) -> EngineResult<Gptr> {
        let payload_words = bytes.div_ceil(WORD_BYTES);
        let failed = || EngineError::AllocationFailed {
            pool: self.pool_id,
            requested_bytes: bytes,
        };
        let class = u32::try_from(payload_words).map(size_class).map_err(|_| failed())?;

        let offset = {
            let mut state = self.alloc.lock();
            match state.free.get_mut(&class).and_then(|list| list.pop()) {
                Some(offset) => offset,
                None => {
                    let header = state.next;
                    let end = header + 1 + class as u64;
                    if end > self.n_words as u64 {
                        return Err(failed());
                    }
                    state.next = end;
                    (header + 1) as u32
                }
            }
        };

        let base = offset as usize;
        self.word_at(base - 1).store(header_word(class), Ordering::Relaxed);
        for i in base..base + class as usize {
            self.word_at(i).store(0, Ordering::Relaxed);
        }
        self.used_words.fetch_add(class as u64 + 1, Ordering::Relaxed);
        Ok(Gptr::new(self.pool_id, offset))
    }

    /// Return a never-published block to the free lists immediately.
    pub fn free(&self, ptr: Gptr) {
        if ptr.is_null() {
            return;
        }
        let Some(class) = self.block_class(ptr) else {
            debug!(%ptr, "ignoring free of a pointer that is not a live block");
            return;
        };
        // Clearing the header makes stale pointers fail validation
        self.word_at(ptr.offset() as usize - 1).store(0, Ordering::Release);
        self.used_words.fetch_sub(class as u64 + 1, Ordering::Relaxed);
        let mut state = self.alloc.lock();
        state.free.entry(class).or_default().push(ptr.offset());
    }

    /// Schedule a block for reuse once no in-flight operation can observe it.
    ///
    /// Triggers an opportunistic [`Heap::reclaim`] when the retire list
    /// reaches the configured batch size.
    pub fn retire(&self, ptr: Gptr) {
        if ptr.is_null() {
            return;
        }
        let epoch = self.epochs.current();
        let pending = {
            let mut retired = self.retired.lock();
            retired.push(Retired { ptr, epoch });
            retired.len()
        };
        if pending >= self.retire_batch {
            self.reclaim();
        }
    }

    /// Advance the epoch and free every retired block that has drained.
    ///
    /// Returns the number of blocks reclaimed.
    pub fn reclaim(&self) -> usize {
        self.epochs.advance();
        let horizon = self.epochs.reclaim_horizon();
        let ready: Vec<Gptr> = {
            let mut retired = self.retired.lock();
            let mut ready = Vec::new();
            retired.retain(|r| {
                let drained = r.epoch < horizon;
                if drained {
                    ready.push(r.ptr);
                }
                !drained
            });
            ready
        };
        for ptr in &ready {
            self.free(*ptr);
        }
        if !ready.is_empty() {
            self.reclaimed.fetch_add(ready.len() as u64, Ordering::Relaxed);
            debug!(pool = %self.pool_id, reclaimed = ready.len(), "reclaimed retired blocks");
        }
        ready.len()
    }

    /// Size class (payload words) of the live block at `ptr`, if it is one.
    pub fn block_class(&self, ptr: Gptr) -> Option<u32> {
        if ptr.pool() != self.pool_id || ptr.is_null() {
            return None;
        }
        let header_at = ptr.offset() as usize - 1;
        if header_at >= self.n_words {
            return None;
        }
        // An uncommitted segment holds no blocks
        let segment = self.segments[header_at / SEGMENT_WORDS].get()?;
        let header = segment[header_at % SEGMENT_WORDS].load(Ordering::Acquire);
        if header >> 32 != BLOCK_MAGIC {
            return None;
        }
        let class = (header & 0xFFFF_FFFF) as u32;
        if header_at + 1 + class as usize > self.n_words {
            return None;
        }
        Some(class)
    }

    /// Atomic load of word `idx` inside the block at `ptr`.
    pub fn load(&self, ptr: Gptr, idx: usize) -> u64 {
        self.word(ptr, idx).load(Ordering::Acquire)
    }

    /// Atomic store of word `idx` inside the block at `ptr`.
    pub fn store(&self, ptr: Gptr, idx: usize, value: u64) {
        self.word(ptr, idx).store(value, Ordering::Release)
    }

    /// Compare-and-swap word `idx` inside the block at `ptr`.
    pub fn compare_exchange(&self, ptr: Gptr, idx: usize, current: u64, new: u64) -> Result<u64, u64> {
        self.word(ptr, idx)
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Raise word `idx` inside the block at `ptr` to at least `value`.
    pub fn fetch_max(&self, ptr: Gptr, idx: usize, value: u64) -> u64 {
        self.word(ptr, idx).fetch_max(value, Ordering::AcqRel)
    }

    /// Copy `bytes` into the block starting at word `idx`.
    pub fn write_bytes(&self, ptr: Gptr, idx: usize, bytes: &[u8]) {
        for (i, chunk) in bytes.chunks(WORD_BYTES).enumerate() {
            let mut word = [0u8; WORD_BYTES];
            word[..chunk.len()].copy_from_slice(chunk);
            self.word(ptr, idx + i).store(u64::from_le_bytes(word), Ordering::Relaxed);
        }
    }

    /// Copy `len` bytes out of the block starting at word `idx`.
    pub fn read_bytes(&self, ptr: Gptr, idx: usize, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut i = 0;
        while out.len() < len {
            let word = self.word(ptr, idx + i).load(Ordering::Relaxed).to_le_bytes();
            let take = (len - out.len()).min(WORD_BYTES);
            out.extend_from_slice(&word[..take]);
            i += 1;
        }
        out
    }

    /// Current usage counters.
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            capacity_bytes: (self.n_words * WORD_BYTES) as u64,
            committed_bytes: self.committed_words.load(Ordering::Relaxed) * WORD_BYTES as u64,
            used_bytes: self.used_words.load(Ordering::Relaxed) * WORD_BYTES as u64,
            retired_blocks: self.retired.lock().len(),
            reclaimed_blocks: self.reclaimed.load(Ordering::Relaxed),
        }
    }

    fn word(&self, ptr: Gptr, idx: usize) -> &AtomicU64 {
        debug_assert_eq!(ptr.pool(), self.pool_id, "pointer from a foreign pool");
        self.word_at(ptr.offset() as usize + idx)
    }

    fn word_at(&self, i: usize) -> &AtomicU64 {
        let index = i / SEGMENT_WORDS;
        let segment = self.segments[index].get_or_init(|| {
            let len = SEGMENT_WORDS.min(self.n_words - index * SEGMENT_WORDS);
            self.committed_words.fetch_add(len as u64, Ordering::Relaxed);
            debug!(pool = %self.pool_id, segment = index, words = len, "committed heap segment");
            (0..len).map(|_| AtomicU64::new(0)).collect()
        });
        &segment[i % SEGMENT_WORDS]
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("pool_id", &self.pool_id)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Registry of pools, keyed by pool id.
#[derive(Default)]
pub struct MemoryManager {
    heaps: RwLock<HashMap<PoolId, Arc<Heap>>>,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a new pool.
    pub fn create_heap(
        &self,
        pool_id: PoolId,
        size_bytes: u64,
        epoch_slots: usize,
        retire_batch: usize,
    ) -> EngineResult<Arc<Heap>> {
        let mut heaps = self.heaps.write();
        if heaps.contains_key(&pool_id) {
            return Err(EngineError::PoolExists { pool: pool_id });
        }
        let heap = Arc::new(Heap::new(pool_id, size_bytes, epoch_slots, retire_batch));
        heaps.insert(pool_id, Arc::clone(&heap));
        debug!(pool = %pool_id, size_bytes, "created heap");
        Ok(heap)
    }

    /// Look up a registered pool.
    pub fn find_heap(&self, pool_id: PoolId) -> EngineResult<Arc<Heap>> {
        self.heaps
            .read()
            .get(&pool_id)
            .cloned()
            .ok_or(EngineError::PoolNotFound { pool: pool_id })
    }

    /// Look up a pool, creating it with the given parameters if missing.
    pub fn find_or_create_heap(
        &self,
        pool_id: PoolId,
        size_bytes: u64,
        epoch_slots: usize,
        retire_batch: usize,
    ) -> Arc<Heap> {
        let mut heaps = self.heaps.write();
        Arc::clone(heaps.entry(pool_id).or_insert_with(|| {
            debug!(pool = %pool_id, size_bytes, "created heap");
            Arc::new(Heap::new(pool_id, size_bytes, epoch_slots, retire_batch))
        }))
    }

    /// Unregister a pool. Engines still attached keep it alive.
    pub fn destroy_heap(&self, pool_id: PoolId) -> EngineResult<()> {
        self.heaps
            .write()
            .remove(&pool_id)
            .map(|_| ())
            .ok_or(EngineError::PoolNotFound { pool: pool_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_heap() -> Heap {
        Heap::new(PoolId(3), 64 * 1024, 8, 1024)
    }

    #[test]
    fn test_size_classes() {
        assert_eq!(size_class(0), 8);
        assert_eq!(size_class(1), 8);
        assert_eq!(size_class(9), 16);
        assert_eq!(size_class(263), 264);
        assert_eq!(size_class(600), 1024);
    }

    #[test]
    fn test_alloc_is_zeroed_and_valid() {
        let heap = small_heap();
        let p = heap.alloc(100).unwrap();
        assert!(!p.is_null());
        assert_eq!(p.pool(), PoolId(3));
        assert_eq!(heap.block_class(p), Some(16));
        for i in 0..16 {
            assert_eq!(heap.load(p, i), 0);
        }
    }

    #[test]
    fn test_bytes_round_trip() {
        let heap = small_heap();
        let p = heap.alloc(13).unwrap();
        heap.write_bytes(p, 0, b"hello, world!");
        assert_eq!(heap.read_bytes(p, 0, 13), b"hello, world!");
        assert_eq!(heap.read_bytes(p, 0, 5), b"hello");
    }

    #[test]
    fn test_free_recycles_block() {
        let heap = small_heap();
        let a = heap.alloc(64).unwrap();
        heap.store(a, 0, 99);
        heap.free(a);
        let b = heap.alloc(64).unwrap();
        assert_eq!(a, b);
        // Recycled blocks come back zeroed
        assert_eq!(heap.load(b, 0), 0);
    }

    #[test]
    fn test_exhaustion_reports_allocation_failed() {
        let heap = small_heap(); // 8192 words
        let mut n = 0;
        loop {
            match heap.alloc(1024) {
                Ok(_) => n += 1,
                Err(EngineError::AllocationFailed { pool, requested_bytes }) => {
                    assert_eq!(pool, PoolId(3));
                    assert_eq!(requested_bytes, 1024);
                    break;
                }
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert!(n > 0);
    }

    #[test]
    fn test_retire_waits_for_active_operation() {
        let heap = small_heap();
        let p = heap.alloc(8).unwrap();

        let op = heap.enter();
        heap.retire(p);
        assert_eq!(heap.reclaim(), 0, "reader pinned before retire must hold the block");
        assert_eq!(heap.stats().retired_blocks, 1);

        drop(op);
        assert_eq!(heap.reclaim(), 1);
        assert_eq!(heap.stats().retired_blocks, 0);
        assert_eq!(heap.stats().reclaimed_blocks, 1);
    }

    #[test]
    fn test_later_operation_does_not_block_reclaim() {
        let heap = small_heap();
        let p = heap.alloc(8).unwrap();
        heap.retire(p);
        heap.epochs().advance();
        let _late = heap.enter();
        assert_eq!(heap.reclaim(), 1);
    }

    #[test]
    fn test_block_class_rejects_garbage() {
        let heap = small_heap();
        let p = heap.alloc(8).unwrap();
        assert!(heap.block_class(Gptr::new(PoolId(3), p.offset() + 1)).is_none());
        assert!(heap.block_class(Gptr::new(PoolId(9), p.offset())).is_none());
        assert!(heap.block_class(Gptr::new(PoolId(3), u32::MAX)).is_none());
    }

    #[test]
    fn test_segments_commit_on_first_use() {
        let heap = Heap::new(PoolId(4), 1024 * 1024 * 1024, 8, 64);
        let stats = heap.stats();
        assert_eq!(stats.capacity_bytes, 1024 * 1024 * 1024);
        assert_eq!(stats.committed_bytes, 0);

        let p = heap.alloc(64).unwrap();
        assert_eq!(heap.stats().committed_bytes, (SEGMENT_WORDS * WORD_BYTES) as u64);
        // Offsets in a segment nobody reached are not blocks
        let far = Gptr::new(PoolId(4), (SEGMENT_WORDS * 64) as u32);
        assert!(heap.block_class(far).is_none());
        assert_eq!(heap.stats().committed_bytes, (SEGMENT_WORDS * WORD_BYTES) as u64);
        assert_eq!(heap.block_class(p), Some(8));
    }

    #[test]
    fn test_block_straddling_segments() {
        let heap = Heap::new(PoolId(5), 3 * (SEGMENT_WORDS * WORD_BYTES) as u64, 8, 64);
        // Fill most of the first segment, then cross into the second
        let mut last = heap.alloc(WORD_BYTES * 4096).unwrap();
        while (last.offset() as usize) < SEGMENT_WORDS - 4096 {
            last = heap.alloc(WORD_BYTES * 4096).unwrap();
        }
        heap.write_bytes(last, 4080, &[0xAB; 64]);
        assert_eq!(heap.read_bytes(last, 4080, 64), vec![0xAB; 64]);
        assert!(heap.stats().committed_bytes >= 2 * (SEGMENT_WORDS * WORD_BYTES) as u64);
    }

    #[test]
    fn test_fetch_max_only_raises() {
        let heap = small_heap();
        let p = heap.alloc(8).unwrap();
        heap.fetch_max(p, 0, 10);
        heap.fetch_max(p, 0, 4);
        assert_eq!(heap.load(p, 0), 10);
    }

    #[test]
    fn test_memory_manager_registry() {
        let mmgr = MemoryManager::new();
        let h = mmgr.create_heap(PoolId(1), 64 * 1024, 4, 16).unwrap();
        assert!(matches!(
            mmgr.create_heap(PoolId(1), 64 * 1024, 4, 16),
            Err(EngineError::PoolExists { .. })
        ));
        let found = mmgr.find_heap(PoolId(1)).unwrap();
        assert!(Arc::ptr_eq(&h, &found));
        let again = mmgr.find_or_create_heap(PoolId(1), 1, 1, 1);
        assert!(Arc::ptr_eq(&h, &again));

        mmgr.destroy_heap(PoolId(1)).unwrap();
        assert!(matches!(mmgr.find_heap(PoolId(1)), Err(EngineError::PoolNotFound { .. })));
    }
}
