//! Range iterator state and the registry of live iterators
//!
//! An iterator remembers its bounds and the last key it returned. Each
//! `get_next` is a fresh ordered seek from the root past that key, so there
//! is no snapshot: concurrent writes at or after the cursor may or may not be
//! seen, keys before the cursor are never revisited, and output is strictly
//! ascending.
//!
//! The registry's mutex guards membership only. Each iterator carries its
//! own mutex, held for the duration of one step.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::engine::RadixTreeEngine;
use crate::error::{EngineError, EngineResult};
use crate::radix_tree::LowerBound;

/// Opaque iterator handle returned by `scan`.
pub type IterHandle = u64;

/// Bounds and cursor of one range iterator.
#[derive(Debug)]
pub(crate) struct IterState {
    begin: Option<Vec<u8>>,
    begin_inclusive: bool,
    end: Option<Vec<u8>>,
    end_inclusive: bool,
    /// Last key returned
    cursor: Option<Vec<u8>>,
    done: bool,
    last_used: Instant,
}

impl IterState {
    /// An empty bound key means the side is open.
    pub(crate) fn new(begin: &[u8], begin_inclusive: bool, end: &[u8], end_inclusive: bool) -> Self {
        Self {
            begin: (!begin.is_empty()).then(|| begin.to_vec()),
            begin_inclusive,
            end: (!end.is_empty()).then(|| end.to_vec()),
            end_inclusive,
            cursor: None,
            done: false,
            last_used: Instant::now(),
        }
    }

    /// Where the next seek starts.
    pub(crate) fn lower_bound(&self) -> LowerBound<'_> {
        match (&self.cursor, &self.begin) {
            (Some(cursor), _) => Some((cursor.as_slice(), false)),
            (None, Some(begin)) => Some((begin.as_slice(), self.begin_inclusive)),
            (None, None) => None,
        }
    }

    /// Whether `key` lies beyond the upper bound.
    pub(crate) fn past_end(&self, key: &[u8]) -> bool {
        match &self.end {
            None => false,
            Some(end) if self.end_inclusive => key > end.as_slice(),
            Some(end) => key >= end.as_slice(),
        }
    }

    pub(crate) fn advance_to(&mut self, key: Vec<u8>) {
        self.cursor = Some(key);
    }

    pub(crate) fn finish(&mut self) {
        self.done = true;
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

/// Process-wide collection of live iterators.
#[derive(Debug)]
pub(crate) struct IterRegistry {
    next_handle: AtomicU64,
    iters: Mutex<HashMap<IterHandle, Arc<Mutex<IterState>>>>,
}

impl IterRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            iters: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, state: IterState) -> IterHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.iters.lock().insert(handle, Arc::new(Mutex::new(state)));
        handle
    }

    pub(crate) fn get(&self, handle: IterHandle) -> EngineResult<Arc<Mutex<IterState>>> {
        self.iters
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(EngineError::InvalidIterator { handle })
    }

    pub(crate) fn remove(&self, handle: IterHandle) -> EngineResult<()> {
        self.iters
            .lock()
            .remove(&handle)
            .map(|_| ())
            .ok_or(EngineError::InvalidIterator { handle })
    }

    /// Drop iterators idle for longer than `ttl`. Returns how many went.
    pub(crate) fn reap_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut iters = self.iters.lock();
        let before = iters.len();
        // An iterator mid-step is in use, never idle
        iters.retain(|_, state| match state.try_lock() {
            Some(s) => now.duration_since(s.last_used) < ttl,
            None => true,
        });
        before - iters.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.iters.lock().len()
    }
}

/// Iterator over a key range that closes its handle when dropped.
pub struct ScanIter<'a> {
    engine: &'a RadixTreeEngine,
    handle: IterHandle,
    finished: bool,
}

impl<'a> ScanIter<'a> {
    pub(crate) fn new(engine: &'a RadixTreeEngine, handle: IterHandle) -> Self {
        Self { engine, handle, finished: false }
    }

    /// Handle of the underlying registry entry.
    pub fn handle(&self) -> IterHandle {
        self.handle
    }
}

impl Iterator for ScanIter<'_> {
    type Item = EngineResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.engine.get_next(self.handle) {
            Ok(pair) => Some(Ok(pair)),
            Err(EngineError::IterationDone) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for ScanIter<'_> {
    fn drop(&mut self) {
        // Already reaped by maintenance is fine
        let _ = self.engine.close_scan(self.handle);
    }
}
