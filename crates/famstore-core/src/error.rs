//! Error types for FamStore engine operations
//!
//! All engine errors are represented by the EngineError enum. Size violations
//! and misses are reported to the immediate caller and never retried inside
//! the engine.

use std::error::Error;
use std::fmt;

use crate::gptr::{Gptr, PoolId};

/// FamStore engine error types with detailed context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Key absent on a read or delete
    NotFound,

    /// Key exceeds the radix tree's fixed maximum
    KeyTooLong {
        /// Length of the offending key
        len: usize,
        /// Maximum allowed key length
        max: usize,
    },

    /// Value exceeds the configured maximum
    ValueTooLong {
        /// Length of the offending value
        len: usize,
        /// Maximum allowed value length
        max: usize,
    },

    /// The heap could not satisfy an allocation
    AllocationFailed {
        /// Pool that ran out of space
        pool: PoolId,
        /// Requested size in bytes
        requested_bytes: usize,
    },

    /// Range iterator moved past its upper bound
    IterationDone,

    /// Iterator handle is unknown (never issued, closed, or reaped)
    InvalidIterator {
        /// The offending handle
        handle: u64,
    },

    /// A caller-supplied global pointer does not reference a tree node
    InvalidPointer {
        /// The offending pointer
        ptr: Gptr,
        /// Why it was rejected
        reason: &'static str,
    },

    /// Value buffer failed checksum verification
    Corrupted {
        /// Location of the damaged buffer
        ptr: Gptr,
        /// Checksum stored with the buffer
        expected: u32,
        /// Checksum computed on read
        actual: u32,
    },

    /// A pool with this id is already registered
    PoolExists {
        /// The conflicting pool id
        pool: PoolId,
    },

    /// No pool with this id is registered
    PoolNotFound {
        /// The missing pool id
        pool: PoolId,
    },

    /// Engine configuration rejected at open
    InvalidConfig {
        /// Validation message
        reason: String,
    },

    /// Background thread could not be started
    Spawn {
        /// OS error message
        message: String,
    },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NotFound => write!(f, "Key not found"),

            EngineError::KeyTooLong { len, max } => {
                write!(f, "Key too long: {} bytes exceeds limit of {} bytes", len, max)
            }

            EngineError::ValueTooLong { len, max } => {
                write!(f, "Value too long: {} bytes exceeds limit of {} bytes", len, max)
            }

            EngineError::AllocationFailed { pool, requested_bytes } => {
                write!(f, "Allocation of {} bytes failed in pool {}", requested_bytes, pool)
            }

            EngineError::IterationDone => write!(f, "Iteration done"),

            EngineError::InvalidIterator { handle } => {
                write!(f, "Invalid iterator handle {}", handle)
            }

            EngineError::InvalidPointer { ptr, reason } => {
                write!(f, "Invalid global pointer {}: {}", ptr, reason)
            }

            EngineError::Corrupted { ptr, expected, actual } => {
                write!(f, "Value buffer at {} corrupted: expected crc 0x{:08x}, got 0x{:08x}",
                       ptr, expected, actual)
            }

            EngineError::PoolExists { pool } => write!(f, "Pool {} already exists", pool),

            EngineError::PoolNotFound { pool } => write!(f, "Pool {} not found", pool),

            EngineError::InvalidConfig { reason } => {
                write!(f, "Invalid engine configuration: {}", reason)
            }

            EngineError::Spawn { message } => {
                write!(f, "Failed to spawn background thread: {}", message)
            }
        }
    }
}

impl Error for EngineError {}

/// Result type alias for FamStore engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::KeyTooLong { len: 41, max: 40 };
        let display = format!("{}", err);
        assert!(display.contains("Key too long"));
        assert!(display.contains("41"));
        assert!(display.contains("40"));
    }

    #[test]
    fn test_corrupted_display_hex() {
        let err = EngineError::Corrupted {
            ptr: Gptr::NULL,
            expected: 0x12345678,
            actual: 0x87654321,
        };
        let display = format!("{}", err);
        assert!(display.contains("0x12345678"));
        assert!(display.contains("0x87654321"));
    }
}
