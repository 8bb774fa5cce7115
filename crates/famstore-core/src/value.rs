//! Value buffers
//!
//! Layout (words):
//!   [0]   length in bytes
//!   [1]   CRC32C of the payload
//!   [2..] payload, little-endian packed
//!
//! A buffer is written completely before its pointer is published and never
//! modified afterwards. Updates install a new buffer.

use crate::error::{EngineError, EngineResult};
use crate::gptr::Gptr;
use crate::heap::{Heap, WORD_BYTES};

const VAL_LEN: usize = 0;
const VAL_CRC: usize = 1;
const VAL_DATA: usize = 2;

/// Allocate and fill a value buffer.
pub(crate) fn write_value(heap: &Heap, value: &[u8]) -> EngineResult<Gptr> {
    let ptr = heap.alloc(VAL_DATA * WORD_BYTES + value.len())?;
    heap.store(ptr, VAL_LEN, value.len() as u64);
    heap.store(ptr, VAL_CRC, crc32c::crc32c(value) as u64);
    heap.write_bytes(ptr, VAL_DATA, value);
    Ok(ptr)
}

/// Copy a value buffer out, verifying its checksum.
///
/// Must run inside an epoch operation that observed `ptr` in a value slot.
pub(crate) fn read_value(heap: &Heap, ptr: Gptr) -> EngineResult<Vec<u8>> {
    let len = heap.load(ptr, VAL_LEN) as usize;
    let expected = heap.load(ptr, VAL_CRC) as u32;
    let bytes = heap.read_bytes(ptr, VAL_DATA, len);
    let actual = crc32c::crc32c(&bytes);
    if actual != expected {
        return Err(EngineError::Corrupted { ptr, expected, actual });
    }
    Ok(bytes)
}
