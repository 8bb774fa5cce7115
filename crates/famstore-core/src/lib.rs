//! FamStore Core: Radix Tree Key-Value Engine over a Shared-Memory Heap
//!
//! An ordered key-value engine whose data lives in pools of word-addressed
//! memory reachable from many threads (and, with a shared heap, many engine
//! instances) at once.
//!
//! # Architecture
//!
//! - **Global pointers**: `(pool, offset)` pairs, meaningful to every engine
//!   attached to the pool; value slots hold tagged pointers whose tag bumps
//!   on every change
//! - **Read path**: lock-free radix tree traversal inside an epoch operation
//! - **Write path**: fresh immutable value buffer, one CAS on the leaf's value
//!   slot, old buffer retired
//! - **Maintenance**: background reclamation of drained buffers and idle
//!   iterators
//!
//! Engines on the same pool can share a tree: publish `location()` from one
//! and pass it to `RadixTreeEngine::open` on another.

pub mod config;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod gptr;
pub mod heap;
pub mod iter;
pub mod maintenance;
pub mod metrics;
pub mod radix_tree;
pub mod store;
mod value;

// Re-export key types for convenience
pub use config::{EngineConfig, MAX_KEY_LEN, TINY_MAX_VAL_LEN};
pub use engine::{CacheStatus, MaintenanceReport, RadixTreeEngine};
pub use error::{EngineError, EngineResult};
pub use gptr::{Gptr, PoolId, TagGptr};
pub use heap::{Heap, HeapStats, MemoryManager};
pub use iter::{IterHandle, ScanIter};
pub use maintenance::{start_maintenance, MaintenanceHandle};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use store::{ErrorKind, KeyValueStore, StoreError};
