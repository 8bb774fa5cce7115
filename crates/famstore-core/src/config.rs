//! Configuration management for FamStore engines
//!
//! Provides sizing presets for different deployments and a validator
//! that engines run at open.

use std::time::Duration;

use crate::gptr::PoolId;

/// Maximum key length supported by the radix tree (bytes).
pub const MAX_KEY_LEN: usize = 40;

/// Value limit of the fixed-slot profile (bytes).
pub const TINY_MAX_VAL_LEN: usize = 8;

/// Engine configuration with sizing presets
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pool the engine allocates from
    pub pool_id: PoolId,
    /// Pool size requested when the pool has to be created (bytes)
    pub heap_size_bytes: u64,
    /// Maximum value size in bytes
    pub max_value_len: usize,
    /// Number of concurrent epoch operations before callers wait
    pub epoch_slots: usize,
    /// Retired blocks that trigger an opportunistic reclaim
    pub retire_batch: usize,
    /// Idle time after which an unclosed iterator is reaped by maintenance
    pub iterator_ttl: Duration,
    /// Background maintenance cadence
    pub maintenance_cadence: Duration,
}

impl EngineConfig {
    /// Server-class node: 1GB pool, committed as it is touched
    pub fn server() -> Self {
        Self {
            pool_id: PoolId(1),
            heap_size_bytes: 1024 * 1024 * 1024,
            max_value_len: 1024 * 1024,
            epoch_slots: 256,
            retire_batch: 1024,
            iterator_ttl: Duration::from_secs(300),
            maintenance_cadence: Duration::from_secs(1),
        }
    }

    /// Small pool for tests and embedded use: 64MB
    pub fn small() -> Self {
        Self {
            pool_id: PoolId(1),
            heap_size_bytes: 64 * 1024 * 1024,
            max_value_len: 64 * 1024,
            epoch_slots: 64,
            retire_batch: 256,
            iterator_ttl: Duration::from_secs(60),
            maintenance_cadence: Duration::from_millis(200),
        }
    }

    /// Fixed-slot profile: values limited to 8 bytes
    pub fn tiny() -> Self {
        Self {
            max_value_len: TINY_MAX_VAL_LEN,
            ..Self::small()
        }
    }

    /// Use a different pool id
    pub fn with_pool(mut self, pool_id: PoolId) -> Self {
        self.pool_id = pool_id;
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.heap_size_bytes < 64 * 1024 {
            return Err("heap_size_bytes must be >= 64KB".into());
        }
        // Offsets are 32-bit word indexes
        if self.heap_size_bytes / 8 > u32::MAX as u64 {
            return Err("heap_size_bytes must be < 32GB".into());
        }
        if self.max_value_len == 0 || self.max_value_len > 128 * 1024 * 1024 {
            return Err("max_value_len must be in [1, 128MB]".into());
        }
        if self.epoch_slots == 0 || self.epoch_slots > 4096 {
            return Err("epoch_slots must be in [1, 4096]".into());
        }
        if self.retire_batch == 0 {
            return Err("retire_batch must be > 0".into());
        }
        if self.iterator_ttl.is_zero() {
            return Err("iterator_ttl must be > 0".into());
        }
        if self.maintenance_cadence.as_millis() == 0 {
            return Err("maintenance_cadence must be > 0".into());
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self { Self::server() }
}
