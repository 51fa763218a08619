//! System limits for buffers and record batches.
//!
//! Every buffer and batch has an explicit maximum size.

/// Smallest fragment the allocation policy hands out.
pub const FRAGMENT_SIZE_BYTES_MIN: usize = 512;

/// Largest fragment the allocation policy hands out (writes larger than
/// this get a fragment of their own size).
pub const FRAGMENT_SIZE_BYTES_MAX: usize = 128 * 1024;

/// Encoded size of a record batch header.
pub const BATCH_HEADER_SIZE: usize = 69;

/// Maximum encoded size of a record batch (header plus body).
pub const BATCH_SIZE_BYTES_MAX: u32 = 16 * 1024 * 1024;

/// Maximum number of records in one batch.
pub const BATCH_RECORD_COUNT_MAX: u32 = 1_000_000;

/// Maximum number of headers on one record.
pub const RECORD_HEADER_COUNT_MAX: u32 = 1024;
