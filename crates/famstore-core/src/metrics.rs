//! Engine operation counters
//!
//! Counters are relaxed atomics bumped on the hot path. `snapshot()` gives a
//! plain copy for reporting and tests.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use crate::heap::HeapStats;

/// Operation counters shared by one or more engines.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    puts: AtomicU64,
    gets: AtomicU64,
    dels: AtomicU64,
    find_or_creates: AtomicU64,
    misses: AtomicU64,
    cache_hits: AtomicU64,
    cache_refreshes: AtomicU64,
    scans: AtomicU64,
    scan_steps: AtomicU64,
    allocation_failures: AtomicU64,
    maintenance_cycles: AtomicU64,
    pruned_nodes: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub puts: u64,
    pub gets: u64,
    pub dels: u64,
    pub find_or_creates: u64,
    /// Reads and deletes that found no value
    pub misses: u64,
    /// Cached gets answered by a tag comparison alone
    pub cache_hits: u64,
    /// Cached gets that had to fetch the value
    pub cache_refreshes: u64,
    pub scans: u64,
    pub scan_steps: u64,
    pub allocation_failures: u64,
    pub maintenance_cycles: u64,
    /// Tree nodes unlinked by deletes
    pub pruned_nodes: u64,
}

macro_rules! counter {
    ($name:ident, $field:ident) => {
        pub fn $name(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_put, puts);
    counter!(record_get, gets);
    counter!(record_del, dels);
    counter!(record_find_or_create, find_or_creates);
    counter!(record_miss, misses);
    counter!(record_cache_hit, cache_hits);
    counter!(record_cache_refresh, cache_refreshes);
    counter!(record_scan, scans);
    counter!(record_scan_step, scan_steps);
    counter!(record_allocation_failure, allocation_failures);
    counter!(record_maintenance, maintenance_cycles);

    pub fn record_pruned(&self, nodes: usize) {
        self.pruned_nodes.fetch_add(nodes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            dels: self.dels.load(Ordering::Relaxed),
            find_or_creates: self.find_or_creates.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_refreshes: self.cache_refreshes.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            scan_steps: self.scan_steps.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            maintenance_cycles: self.maintenance_cycles.load(Ordering::Relaxed),
            pruned_nodes: self.pruned_nodes.load(Ordering::Relaxed),
        }
    }

    /// Emit counters and heap usage as one structured event.
    pub fn report(&self, heap: &HeapStats) {
        let m = self.snapshot();
        info!(
            puts = m.puts,
            gets = m.gets,
            dels = m.dels,
            find_or_creates = m.find_or_creates,
            misses = m.misses,
            cache_hits = m.cache_hits,
            cache_refreshes = m.cache_refreshes,
            scans = m.scans,
            scan_steps = m.scan_steps,
            allocation_failures = m.allocation_failures,
            maintenance_cycles = m.maintenance_cycles,
            pruned_nodes = m.pruned_nodes,
            heap_committed_bytes = heap.committed_bytes,
            heap_used_bytes = heap.used_bytes,
            heap_capacity_bytes = heap.capacity_bytes,
            retired_blocks = heap.retired_blocks,
            reclaimed_blocks = heap.reclaimed_blocks,
            "engine metrics"
        );
    }
}
