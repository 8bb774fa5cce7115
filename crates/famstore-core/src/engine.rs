//! Core storage engine: the heart of FamStore.
//!
//! RadixTreeEngine puts a radix tree over a shared-memory heap and exposes
//! ordered point operations, a version-tagged caching protocol and range
//! scans.
//!
//! **Read path**: traverse inside an epoch operation, copy the value buffer out
//! **Write path**: build the new value buffer, find or create the leaf, CAS the
//! value slot with an incremented tag, retire the old buffer
//! **Delete path**: CAS the slot to null, retire the buffer, then prune the
//! leaf and any valueless single-child ancestors out of the tree
//! **Background**: `maintenance()` reclaims drained buffers and reaps idle
//! iterators (see `maintenance::start_maintenance`)

use std::sync::Arc;

use tracing::info;

use crate::config::{EngineConfig, MAX_KEY_LEN};
use crate::epoch::EpochOp;
use crate::error::{EngineError, EngineResult};
use crate::gptr::{Gptr, TagGptr};
use crate::heap::{Heap, MemoryManager};
use crate::iter::{IterHandle, IterRegistry, IterState, ScanIter};
use crate::metrics::EngineMetrics;
use crate::radix_tree::RadixTree;
use crate::store::KeyValueStore;
use crate::value::{read_value, write_value};

/// Outcome of a cached get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// The caller's tagged pointer still matches the slot
    Current,
    /// The slot had moved on; the value and tagged pointer were refreshed
    Refreshed,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Retired blocks returned to the allocator
    pub reclaimed_blocks: usize,
    /// Idle iterators dropped from the registry
    pub reaped_iterators: usize,
}

/// Radix tree key-value engine over a shared-memory heap.
///
/// All public methods take `&self` and may be called from many threads at
/// once; no external locking is needed. Every traversal runs inside an epoch
/// operation so buffers retired by concurrent writers stay readable until the
/// traversal ends.
pub struct RadixTreeEngine {
    /// Tree structure, rooted at a published global pointer
    tree: RadixTree,
    /// Pool the tree and its values live in
    heap: Arc<Heap>,
    /// Live range iterators
    iters: IterRegistry,
    /// Operation counters
    metrics: Arc<EngineMetrics>,
    /// Engine configuration
    config: EngineConfig,
}

impl RadixTreeEngine {
    /// Open an engine on `config.pool_id`.
    ///
    /// Creates the pool if `mmgr` does not have it yet. With `root` the
    /// engine attaches to an existing tree (another engine's `location()`);
    /// without it a fresh tree is created.
    pub fn open(
        mmgr: &MemoryManager,
        config: EngineConfig,
        root: Option<Gptr>,
        metrics: Arc<EngineMetrics>,
    ) -> EngineResult<Self> {
        config
            .validate()
            .map_err(|reason| EngineError::InvalidConfig { reason })?;

        let heap = mmgr.find_or_create_heap(
            config.pool_id,
            config.heap_size_bytes,
            config.epoch_slots,
            config.retire_batch,
        );

        let tree = match root {
            Some(root) if !root.is_null() => RadixTree::open(Arc::clone(&heap), root)?,
            _ => RadixTree::create(Arc::clone(&heap))?,
        };

        info!(
            pool = %config.pool_id,
            root = %tree.root(),
            attached = root.is_some_and(|r| !r.is_null()),
            "radix tree engine opened"
        );

        Ok(Self {
            tree,
            heap,
            iters: IterRegistry::new(),
            metrics,
            config,
        })
    }

    /// Root pointer; publish it so other engines can attach to this store.
    pub fn location(&self) -> Gptr {
        self.tree.root()
    }

    pub fn max_key_len(&self) -> usize {
        MAX_KEY_LEN
    }

    pub fn max_val_len(&self) -> usize {
        self.config.max_value_len
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    fn check_key(&self, key: &[u8]) -> EngineResult<()> {
        if key.len() > MAX_KEY_LEN {
            return Err(EngineError::KeyTooLong { len: key.len(), max: MAX_KEY_LEN });
        }
        Ok(())
    }

    fn check_value(&self, value: &[u8]) -> EngineResult<()> {
        if value.len() > self.config.max_value_len {
            return Err(EngineError::ValueTooLong {
                len: value.len(),
                max: self.config.max_value_len,
            });
        }
        Ok(())
    }

    fn note_alloc_failure<T>(&self, result: EngineResult<T>) -> EngineResult<T> {
        if let Err(EngineError::AllocationFailed { .. }) = &result {
            self.metrics.record_allocation_failure();
        }
        result
    }

    /// Swing `leaf`'s value slot to `buf`, retiring what it replaced.
    ///
    /// Returns the installed tagged pointer, or `None` when the leaf is being
    /// pruned and the key has to be looked up again.
    fn swap_value(&self, leaf: Gptr, buf: Gptr, _op: &EpochOp<'_>) -> Option<TagGptr> {
        let mut current = self.tree.value(leaf);
        loop {
            if current.is_removed() {
                return None;
            }
            let next = current.successor(buf);
            match self.tree.cas_value(leaf, current, next) {
                Ok(()) => {
                    self.heap.retire(current.gptr());
                    return Some(next);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Leaf for `key`, freeing `buf` if the tree cannot grow.
    fn leaf_for(&self, key: &[u8], buf: Gptr, op: &EpochOp<'_>) -> EngineResult<Gptr> {
        match self.tree.find_or_insert(key, op) {
            Ok(leaf) => Ok(leaf),
            Err(e) => {
                self.heap.free(buf);
                self.note_alloc_failure(Err(e))
            }
        }
    }

    // ------------------------------------------------------------------
    // Put
    // ------------------------------------------------------------------

    /// Insert or overwrite `key`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.put_tracked(key, value).map(|_| ())
    }

    /// Insert or overwrite `key`, returning the leaf pointer and the new
    /// tagged value pointer for caller-side caching.
    ///
    /// The value buffer is built before the leaf is looked up, so an
    /// allocation failure leaves the store as it was.
    pub fn put_tracked(&self, key: &[u8], value: &[u8]) -> EngineResult<(Gptr, TagGptr)> {
        self.check_key(key)?;
        self.check_value(value)?;
        self.metrics.record_put();

        let op = self.heap.enter();
        let buf = self.note_alloc_failure(write_value(&self.heap, value))?;
        loop {
            let leaf = self.leaf_for(key, buf, &op)?;
            if let Some(installed) = self.swap_value(leaf, buf, &op) {
                return Ok((leaf, installed));
            }
            std::hint::spin_loop();
        }
    }

    /// Write through a leaf pointer obtained earlier, skipping the traversal.
    ///
    /// `val_ptr` is updated to the installed tagged pointer. A delete may
    /// prune the leaf; the call then fails with `InvalidPointer` and the
    /// caller goes back to [`RadixTreeEngine::put_tracked`].
    pub fn put_cached(&self, leaf: Gptr, val_ptr: &mut TagGptr, value: &[u8]) -> EngineResult<()> {
        self.check_value(value)?;
        self.tree.validate_node(leaf)?;
        self.metrics.record_put();

        let op = self.heap.enter();
        let buf = self.note_alloc_failure(write_value(&self.heap, value))?;
        match self.swap_value(leaf, buf, &op) {
            Some(installed) => {
                *val_ptr = installed;
                Ok(())
            }
            None => {
                self.heap.free(buf);
                Err(EngineError::InvalidPointer {
                    ptr: leaf,
                    reason: "node was pruned by a delete",
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Get
    // ------------------------------------------------------------------

    /// Read the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> EngineResult<Vec<u8>> {
        self.get_tracked(key).map(|(value, _, _)| value)
    }

    /// Read `key`, also returning the leaf pointer and current tagged value
    /// pointer for caller-side caching.
    pub fn get_tracked(&self, key: &[u8]) -> EngineResult<(Vec<u8>, Gptr, TagGptr)> {
        self.check_key(key)?;
        self.metrics.record_get();

        let op = self.heap.enter();
        let found = self.tree.lookup(key, &op).map(|leaf| (leaf, self.tree.value(leaf)));
        match found {
            Some((leaf, val_ptr)) if !val_ptr.is_null() => {
                let value = read_value(&self.heap, val_ptr.gptr())?;
                Ok((value, leaf, val_ptr))
            }
            _ => {
                self.metrics.record_miss();
                Err(EngineError::NotFound)
            }
        }
    }

    /// Read through a leaf pointer obtained earlier.
    ///
    /// With `get_value == false` the slot's tagged pointer is compared with
    /// `val_ptr` first; on a match the call returns [`CacheStatus::Current`]
    /// and leaves `out` untouched. Otherwise, and always when `get_value` is
    /// set, the value is copied into `out` and `val_ptr` refreshed; the status
    /// tells whether the slot had changed. A vacated slot refreshes `val_ptr`
    /// and yields `NotFound`.
    ///
    /// Once a delete prunes the leaf and maintenance reclaims it, the pointer
    /// fails validation. Should the block be reused for another node before
    /// the next call, the handle reads that node's slot; the tag comparison
    /// reports it as `Refreshed`, never as `Current`.
    pub fn get_cached(
        &self,
        leaf: Gptr,
        val_ptr: &mut TagGptr,
        out: &mut Vec<u8>,
        get_value: bool,
    ) -> EngineResult<CacheStatus> {
        self.tree.validate_node(leaf)?;
        self.metrics.record_get();

        let _op = self.heap.enter();
        let current = self.tree.value(leaf);
        let unchanged = current == *val_ptr;
        if unchanged && !get_value {
            self.metrics.record_cache_hit();
            return Ok(CacheStatus::Current);
        }

        *val_ptr = current;
        if current.is_null() {
            self.metrics.record_miss();
            return Err(EngineError::NotFound);
        }
        *out = read_value(&self.heap, current.gptr())?;
        if unchanged {
            Ok(CacheStatus::Current)
        } else {
            self.metrics.record_cache_refresh();
            Ok(CacheStatus::Refreshed)
        }
    }

    // ------------------------------------------------------------------
    // FindOrCreate
    // ------------------------------------------------------------------

    /// Return the value under `key`, or install `default` if there is none.
    ///
    /// The decision is a single CAS on the leaf's value slot, so a concurrent
    /// put can never slip in between the check and the insert.
    pub fn find_or_create(&self, key: &[u8], default: &[u8]) -> EngineResult<Vec<u8>> {
        self.check_key(key)?;
        self.check_value(default)?;
        self.metrics.record_find_or_create();

        let op = self.heap.enter();
        let buf = self.note_alloc_failure(write_value(&self.heap, default))?;
        'lookup: loop {
            let leaf = self.leaf_for(key, buf, &op)?;
            let mut current = self.tree.value(leaf);
            loop {
                if current.is_removed() {
                    std::hint::spin_loop();
                    continue 'lookup;
                }
                if !current.is_null() {
                    // Lost to an existing value; our buffer was never published
                    self.heap.free(buf);
                    return read_value(&self.heap, current.gptr());
                }
                match self.tree.cas_value(leaf, current, current.successor(buf)) {
                    Ok(()) => return Ok(default.to_vec()),
                    Err(actual) => current = actual,
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Del
    // ------------------------------------------------------------------

    /// Remove `key`.
    pub fn del(&self, key: &[u8]) -> EngineResult<()> {
        self.del_tracked(key).map(|_| ())
    }

    /// Remove `key`, returning the leaf pointer and the vacated tagged
    /// pointer.
    ///
    /// The value buffer is retired. Unless other keys extend this one, the
    /// leaf is pruned and retired too, so the returned leaf pointer is only
    /// good for comparing against handles cached earlier.
    pub fn del_tracked(&self, key: &[u8]) -> EngineResult<(Gptr, TagGptr)> {
        self.check_key(key)?;
        self.metrics.record_del();

        let op = self.heap.enter();
        let Some(leaf) = self.tree.lookup(key, &op) else {
            self.metrics.record_miss();
            return Err(EngineError::NotFound);
        };
        let vacated = self.vacate(leaf, &op)?;
        Ok((leaf, vacated))
    }

    /// Delete through a leaf pointer obtained earlier.
    pub fn del_cached(&self, leaf: Gptr, val_ptr: &mut TagGptr) -> EngineResult<()> {
        self.tree.validate_node(leaf)?;
        self.metrics.record_del();

        let op = self.heap.enter();
        match self.vacate(leaf, &op) {
            Ok(vacated) => {
                *val_ptr = vacated;
                Ok(())
            }
            Err(e) => {
                *val_ptr = self.tree.value(leaf);
                Err(e)
            }
        }
    }

    fn vacate(&self, leaf: Gptr, op: &EpochOp<'_>) -> EngineResult<TagGptr> {
        let mut current = self.tree.value(leaf);
        loop {
            if current.is_null() {
                self.metrics.record_miss();
                return Err(EngineError::NotFound);
            }
            let next = current.successor(Gptr::NULL);
            match self.tree.cas_value(leaf, current, next) {
                Ok(()) => {
                    self.heap.retire(current.gptr());
                    let pruned = self.tree.prune(leaf, op);
                    if pruned > 0 {
                        self.metrics.record_pruned(pruned);
                    }
                    return Ok(next);
                }
                Err(actual) => current = actual,
            }
        }
    }

    // ------------------------------------------------------------------
    // Scan
    // ------------------------------------------------------------------

    /// Open a range iterator over `[begin, end]`.
    ///
    /// An empty bound key leaves that side open. The handle must be released
    /// with [`RadixTreeEngine::close_scan`] (or use [`RadixTreeEngine::scan_iter`]);
    /// iterators idle past `iterator_ttl` are reaped by maintenance.
    pub fn scan(
        &self,
        begin: &[u8],
        begin_inclusive: bool,
        end: &[u8],
        end_inclusive: bool,
    ) -> EngineResult<IterHandle> {
        self.check_key(begin)?;
        self.check_key(end)?;
        self.metrics.record_scan();
        Ok(self.iters.register(IterState::new(begin, begin_inclusive, end, end_inclusive)))
    }

    /// Next key and value in ascending order, or `IterationDone`.
    pub fn get_next(&self, handle: IterHandle) -> EngineResult<(Vec<u8>, Vec<u8>)> {
        let state = self.iters.get(handle)?;
        let mut state = state.lock();
        state.touch();
        if state.is_done() {
            return Err(EngineError::IterationDone);
        }

        let op = self.heap.enter();
        let Some(hit) = self.tree.seek(state.lower_bound(), &op) else {
            state.finish();
            return Err(EngineError::IterationDone);
        };
        if state.past_end(&hit.key) {
            state.finish();
            return Err(EngineError::IterationDone);
        }
        let value = read_value(&self.heap, hit.value.gptr())?;
        self.metrics.record_scan_step();
        state.advance_to(hit.key.clone());
        Ok((hit.key, value))
    }

    /// Release an iterator handle.
    pub fn close_scan(&self, handle: IterHandle) -> EngineResult<()> {
        self.iters.remove(handle)
    }

    /// Range scan as a Rust iterator; the handle is closed on drop.
    pub fn scan_iter(
        &self,
        begin: &[u8],
        begin_inclusive: bool,
        end: &[u8],
        end_inclusive: bool,
    ) -> EngineResult<ScanIter<'_>> {
        let handle = self.scan(begin, begin_inclusive, end, end_inclusive)?;
        Ok(ScanIter::new(self, handle))
    }

    /// Delete every key, returning how many were removed.
    ///
    /// Not atomic: keys inserted while the sweep runs may survive.
    pub fn clear(&self) -> EngineResult<usize> {
        let keys = self
            .scan_iter(b"", true, b"", true)?
            .map(|item| item.map(|(key, _)| key))
            .collect::<EngineResult<Vec<_>>>()?;
        let mut removed = 0;
        for key in keys {
            match self.del(&key) {
                Ok(()) => removed += 1,
                Err(EngineError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        info!(pool = %self.config.pool_id, removed, "store cleared");
        Ok(removed)
    }

    /// Number of open iterators.
    pub fn live_iterators(&self) -> usize {
        self.iters.len()
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    /// Reclaim drained value buffers and drop idle iterators.
    pub fn maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            reclaimed_blocks: self.heap.reclaim(),
            reaped_iterators: self.iters.reap_idle(self.config.iterator_ttl),
        };
        self.metrics.record_maintenance();
        report
    }

    /// Log counters and heap usage.
    pub fn report_metrics(&self) {
        self.metrics.report(&self.heap.stats());
    }
}

impl std::fmt::Debug for RadixTreeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadixTreeEngine")
            .field("pool", &self.config.pool_id)
            .field("root", &self.tree.root())
            .field("iterators", &self.iters.len())
            .finish()
    }
}

impl KeyValueStore for RadixTreeEngine {
    type Error = EngineError;

    fn put(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        RadixTreeEngine::put(self, key, value)
    }

    fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        match RadixTreeEngine::get(self, key) {
            Ok(value) => Ok(Some(value)),
            Err(EngineError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn del(&self, key: &[u8]) -> EngineResult<bool> {
        match RadixTreeEngine::del(self, key) {
            Ok(()) => Ok(true),
            Err(EngineError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn clear(&self) -> EngineResult<()> {
        RadixTreeEngine::clear(self).map(|_| ())
    }

    fn max_key_len(&self) -> usize {
        RadixTreeEngine::max_key_len(self)
    }

    fn max_val_len(&self) -> usize {
        RadixTreeEngine::max_val_len(self)
    }
}
