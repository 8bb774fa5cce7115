//! The `{put, get, del}` capability shared by every storage backend
//!
//! A storage node serves any `KeyValueStore`; the local radix tree engine and
//! the remote cluster client both implement it.

use std::error::Error;

use crate::error::EngineError;

/// Coarse classification of backend errors, used to pick wire status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    KeyTooLong,
    ValueTooLong,
    OutOfMemory,
    Unavailable,
    Other,
}

/// Errors a [`KeyValueStore`] can return.
pub trait StoreError: Error + Send + Sync + 'static {
    fn kind(&self) -> ErrorKind;
}

/// Key-value capability: point reads, writes and deletes.
pub trait KeyValueStore: Send + Sync {
    type Error: StoreError;

    /// Insert or overwrite.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Self::Error>;

    /// Read a value; `Ok(None)` when the key is absent.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Delete a key; `Ok(false)` when it was absent.
    fn del(&self, key: &[u8]) -> Result<bool, Self::Error>;

    /// Remove every key.
    fn clear(&self) -> Result<(), Self::Error>;

    /// Longest key accepted.
    fn max_key_len(&self) -> usize;

    /// Longest value accepted.
    fn max_val_len(&self) -> usize;
}

impl StoreError for EngineError {
    fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound => ErrorKind::NotFound,
            EngineError::KeyTooLong { .. } => ErrorKind::KeyTooLong,
            EngineError::ValueTooLong { .. } => ErrorKind::ValueTooLong,
            EngineError::AllocationFailed { .. } => ErrorKind::OutOfMemory,
            _ => ErrorKind::Other,
        }
    }
}
