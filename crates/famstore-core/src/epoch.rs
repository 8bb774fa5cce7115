//! Epoch manager for deferred reclamation
//!
//! Every tree operation runs inside an [`EpochOp`]. Entering pins the current
//! global epoch into one of a bounded number of slots; dropping the guard
//! clears the slot, so the slot is released on every exit path.
//!
//! A block retired at epoch `R` may still be referenced by an operation that
//! pinned an epoch `<= R`. Operations that pin a later epoch started after
//! the block was unlinked and cannot reach it. A retired block is therefore
//! safe to reuse once every occupied slot holds an epoch greater than `R`.

use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::thread;

/// Slot value for "no operation in flight".
const IDLE: u64 = 0;

/// Sweeps over a full slot table before yielding the thread.
const SWEEPS_BEFORE_YIELD: usize = 4;

/// Tracks the global epoch and the epochs pinned by in-flight operations.
pub struct EpochManager {
    /// Global epoch, starts at 1 so that 0 can mean idle
    global: AtomicU64,
    /// Pinned epoch per in-flight operation
    slots: Box<[AtomicU64]>,
    /// Where the next search for a free slot starts
    hint: AtomicUsize,
}

impl EpochManager {
    /// Create a manager allowing `slots` concurrent operations.
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            global: AtomicU64::new(1),
            slots: (0..slots).map(|_| AtomicU64::new(IDLE)).collect(),
            hint: AtomicUsize::new(0),
        }
    }

    /// Begin an epoch operation.
    ///
    /// Blocks (spinning, then yielding) only while every slot is occupied.
    pub fn enter(&self) -> EpochOp<'_> {
        let n = self.slots.len();
        let mut sweeps = 0usize;
        loop {
            let start = self.hint.fetch_add(1, Ordering::Relaxed) % n;
            for i in 0..n {
                let idx = (start + i) % n;
                let epoch = self.global.load(Ordering::SeqCst);
                if self.slots[idx]
                    .compare_exchange(IDLE, epoch, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    // Slot must be visible before any tree pointer is loaded
                    fence(Ordering::SeqCst);
                    return EpochOp { manager: self, slot: idx, epoch };
                }
            }
            sweeps += 1;
            if sweeps % SWEEPS_BEFORE_YIELD == 0 {
                thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Current global epoch.
    pub fn current(&self) -> u64 {
        self.global.load(Ordering::SeqCst)
    }

    /// Advance the global epoch, returning the new value.
    pub fn advance(&self) -> u64 {
        self.global.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Oldest epoch pinned by an in-flight operation, if any.
    pub fn min_active(&self) -> Option<u64> {
        fence(Ordering::SeqCst);
        self.slots
            .iter()
            .map(|s| s.load(Ordering::SeqCst))
            .filter(|&e| e != IDLE)
            .min()
    }

    /// Blocks retired at an epoch below the horizon can no longer be
    /// observed by any in-flight operation.
    pub fn reclaim_horizon(&self) -> u64 {
        self.min_active().unwrap_or(u64::MAX)
    }

    /// Number of operations currently in flight.
    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.load(Ordering::Relaxed) != IDLE)
            .count()
    }
}

/// Guard for one in-flight epoch operation.
pub struct EpochOp<'a> {
    manager: &'a EpochManager,
    slot: usize,
    epoch: u64,
}

impl EpochOp<'_> {
    /// Epoch pinned by this operation.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for EpochOp<'_> {
    fn drop(&mut self) {
        self.manager.slots[self.slot].store(IDLE, Ordering::Release);
    }
}
