//! Constants related to allocation policy and the metadata accumulator.

/// Factor by which an idle accumulator buffer must be oversized before it is
/// shrunk, and the factor it is shrunk by.
pub const ACCUM_THROTTLE: usize = 8;

/// Accumulator buffers at or below this capacity are never shrunk.
pub const ACCUM_THRESHOLD: usize = 2048;

/// Default size of a metadata aggregation slab.
pub const DEFAULT_META_BLOCK_SIZE: u64 = 2048;

/// Default size of a small raw data aggregation slab.
pub const DEFAULT_SDATA_BLOCK_SIZE: u64 = 2048;

/// Blocks up to this size are copied through a stack buffer by
/// [`crate::VfdFile::realloc`]; larger ones go through the heap.
pub(crate) const STACK_COPY_SIZE: usize = 8192;

/// Minimum number of bytes a file-backed driver grows its file by.
// 64MB
#[cfg(not(test))]
pub(crate) const MIN_FILE_GROWTH_SIZE: u64 = 1 << 26;

/// Minimum number of bytes a file-backed driver grows its file by.
// 8KB
#[cfg(test)]
pub(crate) const MIN_FILE_GROWTH_SIZE: u64 = 1 << 13;

const _: () = {
    assert!(ACCUM_THROTTLE > 1, "throttle must actually shrink the buffer");
    assert!(
        ACCUM_THRESHOLD / ACCUM_THROTTLE > 0,
        "a shrunk accumulator buffer must not be empty"
    );
    assert!(DEFAULT_META_BLOCK_SIZE > 0 && DEFAULT_SDATA_BLOCK_SIZE > 0);
};
