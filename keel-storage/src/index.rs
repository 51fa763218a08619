//! Sparse offset index for a segment.
//!
//! Maps a sample of batch base offsets to their byte position in the segment
//! file. Lookups return the closest entry at or below the target, and the
//! reader scans forward from there.
//!
//! # File Format
//!
//! `<segment>.base_index`, little-endian:
//!
//! ```text
//! magic u32 | version u32 | base_offset u64 | covered_bytes u64 |
//! max_timestamp i64 | entry_count u32 |
//! (offset_delta u32 | position u32)* | crc32 u32
//! ```
//!
//! `covered_bytes` is the data-file size the index was written for. An index
//! whose coverage differs from the data file is stale and gets rebuilt.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use keel_core::{Offset, Timestamp};

/// Index file magic ("KIDX").
const INDEX_MAGIC: u32 = 0x4B49_4458;

/// Index file format version.
const INDEX_VERSION: u32 = 1;

/// Fixed bytes before the entries.
const INDEX_HEADER_SIZE: usize = 4 + 4 + 8 + 8 + 8 + 4;

/// One index sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Batch base offset.
    pub offset: Offset,
    /// Byte position of the batch in the segment.
    pub position: u64,
}

/// Sparse offset-to-position index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseIndex {
    base_offset: Offset,
    entries: Vec<IndexEntry>,
    interval_bytes: u64,
    bytes_since_entry: u64,
    max_timestamp: Timestamp,
}

impl SparseIndex {
    /// Creates an empty index for a segment starting at `base_offset`.
    #[must_use]
    pub const fn new(base_offset: Offset, interval_bytes: u64) -> Self {
        Self {
            base_offset,
            entries: Vec::new(),
            interval_bytes,
            bytes_since_entry: 0,
            max_timestamp: Timestamp::none(),
        }
    }

    /// Records a batch appended at `position`. Samples the first batch and
    /// then one batch per interval.
    pub fn maybe_track(
        &mut self,
        offset: Offset,
        position: u64,
        size_bytes: u64,
        max_timestamp: Timestamp,
    ) {
        debug_assert!(offset >= self.base_offset);
        if self.entries.is_empty() || self.bytes_since_entry >= self.interval_bytes {
            debug_assert!(self.entries.last().map_or(true, |e| e.offset < offset));
            self.entries.push(IndexEntry { offset, position });
            self.bytes_since_entry = 0;
        }
        self.bytes_since_entry += size_bytes;
        self.max_timestamp = self.max_timestamp.max(max_timestamp);
    }

    /// Returns the last sample whose offset is `<= offset`.
    #[must_use]
    pub fn lookup(&self, offset: Offset) -> Option<IndexEntry> {
        let idx = self.entries.partition_point(|e| e.offset <= offset);
        idx.checked_sub(1).map(|i| self.entries[i])
    }

    /// Drops samples at or above `offset`.
    pub fn truncate(&mut self, offset: Offset) {
        let keep = self.entries.partition_point(|e| e.offset < offset);
        self.entries.truncate(keep);
        self.bytes_since_entry = self.interval_bytes;
    }

    /// Largest batch timestamp tracked.
    #[must_use]
    pub const fn max_timestamp(&self) -> Timestamp {
        self.max_timestamp
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no sample has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encodes the index for a data file of `covered_bytes` bytes.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Deltas and positions bounded by segment size limits.
    pub fn encode(&self, covered_bytes: u64) -> Bytes {
        let mut buf = BytesMut::with_capacity(INDEX_HEADER_SIZE + self.entries.len() * 8 + 4);
        buf.put_u32_le(INDEX_MAGIC);
        buf.put_u32_le(INDEX_VERSION);
        buf.put_u64_le(self.base_offset.get());
        buf.put_u64_le(covered_bytes);
        buf.put_i64_le(self.max_timestamp.as_millis());
        buf.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            buf.put_u32_le((entry.offset.get() - self.base_offset.get()) as u32);
            buf.put_u32_le(entry.position as u32);
        }
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    /// Decodes an index file, returning it with the data size it covers.
    ///
    /// Returns `None` for anything damaged or written for another segment;
    /// callers rebuild from the data file.
    #[must_use]
    pub fn decode(
        mut data: &[u8],
        base_offset: Offset,
        interval_bytes: u64,
    ) -> Option<(Self, u64)> {
        if data.len() < INDEX_HEADER_SIZE + 4 {
            return None;
        }
        let body_len = data.len() - 4;
        let stored_crc = (&data[body_len..]).get_u32_le();
        if crc32fast::hash(&data[..body_len]) != stored_crc {
            return None;
        }
        if data.get_u32_le() != INDEX_MAGIC || data.get_u32_le() != INDEX_VERSION {
            return None;
        }
        if data.get_u64_le() != base_offset.get() {
            return None;
        }
        let covered_bytes = data.get_u64_le();
        let max_timestamp = Timestamp::from_millis(data.get_i64_le());
        let count = data.get_u32_le() as usize;
        if body_len != INDEX_HEADER_SIZE + count * 8 {
            return None;
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let delta = u64::from(data.get_u32_le());
            let position = u64::from(data.get_u32_le());
            entries.push(IndexEntry {
                offset: base_offset.add(delta),
                position,
            });
        }
        Some((
            Self {
                base_offset,
                entries,
                interval_bytes,
                // Force a sample on the next append after reopening.
                bytes_since_entry: interval_bytes,
                max_timestamp,
            },
            covered_bytes,
        ))
    }
}
