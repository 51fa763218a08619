//! Segment files.
//!
//! A segment is one file holding a contiguous run of record batches that all
//! share one raft term, starting at a fixed base offset. There is no file
//! header: the file is the concatenation of encoded batches, each
//! self-describing and CRC-checked.
//!
//! # File Layout
//!
//! ```text
//! <dir>/
//!   0-1-v1.log                # closed segment, term 1
//!   0-1-v1.log.base_index     # its sparse index
//!   1200-2-v1.log             # active segment, term 2
//! ```
//!
//! Appends go to an in-memory write-behind buffer that is written out when it
//! fills up, on `flush`, or on every append when `sync_on_append` is set.
//! Reads see buffered bytes too.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use keel_core::limits::BATCH_HEADER_SIZE;
use keel_core::{IoBuf, Offset, RecordBatch, RecordBatchHeader, TermId, Timestamp};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::LogConfig;
use crate::error::{StorageError, StorageResult};
use crate::index::SparseIndex;
use crate::reader::ReaderConfig;
use crate::storage::{Storage, StorageFile};

/// The only segment format version this code reads and writes.
pub const SEGMENT_FORMAT_VERSION: &str = "v1";

/// Extension of segment data files.
pub const SEGMENT_EXTENSION: &str = ".log";

/// Suffix appended to a segment file name for its index.
pub const INDEX_SUFFIX: &str = ".base_index";

/// Suffix a segment is renamed to when recovery cannot salvage it.
pub const QUARANTINE_SUFFIX: &str = ".cannotrecover";

// ----------------------------------------------------------------------------
// Names
// ----------------------------------------------------------------------------

/// Parsed `<base_offset>-<term>-<version>.log` file name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentName {
    /// First offset the segment may hold.
    pub base_offset: Offset,
    /// Raft term of every batch in the segment.
    pub term: TermId,
    /// Format version string.
    pub version: String,
}

impl SegmentName {
    /// Creates a name in the current format version.
    #[must_use]
    pub fn new(base_offset: Offset, term: TermId) -> Self {
        Self {
            base_offset,
            term,
            version: SEGMENT_FORMAT_VERSION.to_string(),
        }
    }

    /// Parses a file name. Anything that is not exactly
    /// `<digits>-<digits>-<ascii>.log` yields `None`.
    #[must_use]
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(SEGMENT_EXTENSION)?;
        let mut parts = stem.splitn(3, '-');
        let base = parts.next()?;
        let term = parts.next()?;
        let version = parts.next()?;
        if !is_decimal(base) || !is_decimal(term) || version.is_empty() || !version.is_ascii() {
            return None;
        }
        Some(Self {
            base_offset: Offset::new(base.parse().ok()?),
            term: TermId::new(term.parse().ok()?),
            version: version.to_string(),
        })
    }

    /// Returns true if this code understands the format version.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.version == SEGMENT_FORMAT_VERSION
    }

    /// Formats the data file name.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}{}",
            self.base_offset.get(),
            self.term.get(),
            self.version,
            SEGMENT_EXTENSION
        )
    }
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Returns the index file path for a segment path.
#[must_use]
pub fn index_path(segment_path: &Path) -> PathBuf {
    let mut name = segment_path.as_os_str().to_owned();
    name.push(INDEX_SUFFIX);
    PathBuf::from(name)
}

// ----------------------------------------------------------------------------
// Segment
// ----------------------------------------------------------------------------

/// Outcome of scanning the last segment at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Bytes of valid batches kept.
    pub valid_bytes: u64,
    /// Bytes dropped after the last valid batch.
    pub discarded_bytes: u64,
    /// Last offset of the last valid batch.
    pub last_offset: Option<Offset>,
}

/// One segment file and its in-memory state.
pub struct Segment {
    name: SegmentName,
    path: PathBuf,
    storage: Arc<dyn Storage>,
    file: Box<dyn StorageFile>,
    index: SparseIndex,
    /// Bytes already written to the file.
    file_size: u64,
    /// Write-behind bytes, logically at `file_size..`.
    buffer: BytesMut,
    dirty_offset: Option<Offset>,
    flushed_offset: Option<Offset>,
    closed: bool,
    write_buffer_bytes: usize,
    sync_on_append: bool,
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name.to_string())
            .field("size_bytes", &self.size_bytes())
            .field("dirty_offset", &self.dirty_offset)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Segment {
    /// Creates an empty segment file in `dir`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub async fn create(
        storage: Arc<dyn Storage>,
        dir: &Path,
        base_offset: Offset,
        term: TermId,
        config: &LogConfig,
    ) -> StorageResult<Self> {
        let name = SegmentName::new(base_offset, term);
        let path = dir.join(name.file_name());
        let file = storage.open(&path).await?;
        // A leftover file with this name holds offsets the log has discarded.
        file.truncate(0).await?;
        debug!(segment = %name, "created segment");
        Ok(Self {
            index: SparseIndex::new(base_offset, config.index_interval_bytes),
            name,
            path,
            storage,
            file,
            file_size: 0,
            buffer: BytesMut::new(),
            dirty_offset: None,
            flushed_offset: None,
            closed: false,
            write_buffer_bytes: config.write_buffer_bytes,
            sync_on_append: config.sync_on_append,
        })
    }

    /// Opens an existing, cleanly written segment.
    ///
    /// Loads the index file when it is usable and scans batch headers from
    /// its last sample to the end of the file.
    ///
    /// # Errors
    /// Returns [`StorageError::Corruption`] if a batch header is damaged.
    pub async fn open(
        storage: Arc<dyn Storage>,
        path: PathBuf,
        name: SegmentName,
        config: &LogConfig,
    ) -> StorageResult<Self> {
        let file = storage.open(&path).await?;
        let file_size = file.size().await?;
        let index = load_index(storage.as_ref(), &path, &name, config, file_size).await;

        let mut segment = Self {
            name,
            path,
            storage,
            file,
            index,
            file_size,
            buffer: BytesMut::new(),
            dirty_offset: None,
            flushed_offset: None,
            closed: true,
            write_buffer_bytes: config.write_buffer_bytes,
            sync_on_append: config.sync_on_append,
        };
        segment.rebuild_tail().await?;
        segment.flushed_offset = segment.dirty_offset;
        Ok(segment)
    }

    /// Opens the last segment of a log, verifying every batch and cutting
    /// the file at the last valid batch boundary.
    ///
    /// # Errors
    /// Returns an error only for I/O failures; damage is reported in the
    /// outcome.
    pub async fn recover(
        storage: Arc<dyn Storage>,
        path: PathBuf,
        name: SegmentName,
        config: &LogConfig,
    ) -> StorageResult<(Self, RecoveryOutcome)> {
        let file = storage.open(&path).await?;
        let data = file.read_all().await?;
        let mut index = SparseIndex::new(name.base_offset, config.index_interval_bytes);

        let mut pos = 0usize;
        let mut last_offset = None;
        while let Some((header, size)) = valid_batch_at(&data, pos) {
            if header.base_offset < Offset::after(last_offset).max(name.base_offset) {
                warn!(
                    segment = %name,
                    position = pos,
                    base_offset = header.base_offset.get(),
                    "batch offsets go backwards, treating as end of segment"
                );
                break;
            }
            index.maybe_track(header.base_offset, pos as u64, size as u64, header.max_timestamp);
            last_offset = Some(header.last_offset());
            pos += size;
        }

        let valid_bytes = pos as u64;
        let discarded_bytes = data.len() as u64 - valid_bytes;
        if discarded_bytes > 0 {
            warn!(
                segment = %name,
                valid_bytes,
                discarded_bytes,
                "truncating damaged segment tail"
            );
            file.truncate(valid_bytes).await?;
            file.sync().await?;
        }

        let segment = Self {
            name,
            path,
            storage,
            file,
            index,
            file_size: valid_bytes,
            buffer: BytesMut::new(),
            dirty_offset: last_offset,
            flushed_offset: last_offset,
            closed: false,
            write_buffer_bytes: config.write_buffer_bytes,
            sync_on_append: config.sync_on_append,
        };
        Ok((
            segment,
            RecoveryOutcome {
                valid_bytes,
                discarded_bytes,
                last_offset,
            },
        ))
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// The parsed file name.
    #[must_use]
    pub const fn name(&self) -> &SegmentName {
        &self.name
    }

    /// Path of the data file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// First offset the segment may hold.
    #[must_use]
    pub const fn base_offset(&self) -> Offset {
        self.name.base_offset
    }

    /// Raft term of the segment's batches.
    #[must_use]
    pub const fn term(&self) -> TermId {
        self.name.term
    }

    /// Last offset written, buffered or not.
    #[must_use]
    pub const fn dirty_offset(&self) -> Option<Offset> {
        self.dirty_offset
    }

    /// Last offset known to be on stable storage.
    #[must_use]
    pub const fn flushed_offset(&self) -> Option<Offset> {
        self.flushed_offset
    }

    /// The next offset an append must start at or after.
    #[must_use]
    pub const fn next_offset(&self) -> Offset {
        match self.dirty_offset {
            Some(o) => o.next(),
            None => self.name.base_offset,
        }
    }

    /// Logical size including buffered bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.file_size + self.buffer.len() as u64
    }

    /// Returns true if the segment holds no batch.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.dirty_offset.is_none()
    }

    /// Returns true once `close` has run.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Largest batch timestamp in the segment.
    #[must_use]
    pub const fn max_timestamp(&self) -> Timestamp {
        self.index.max_timestamp()
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Appends a batch whose offsets and term are already assigned.
    ///
    /// Returns the batch's byte position in the segment.
    ///
    /// # Errors
    /// Returns an error if the segment is closed, the batch does not continue
    /// the segment, or a write fails.
    pub async fn append(&mut self, batch: &RecordBatch) -> StorageResult<u64> {
        if self.closed {
            return Err(StorageError::Closed {
                ntp: self.name.to_string(),
            });
        }
        let expected = self.next_offset();
        if batch.base_offset() < expected {
            return Err(StorageError::OutOfOrderAppend {
                expected,
                actual: batch.base_offset(),
            });
        }
        debug_assert_eq!(batch.term(), self.name.term, "segment holds one term");

        let position = self.size_bytes();
        batch.encode(&mut self.buffer);
        self.index.maybe_track(
            batch.base_offset(),
            position,
            u64::from(batch.size_bytes()),
            batch.header().max_timestamp,
        );
        self.dirty_offset = Some(batch.last_offset());

        if self.sync_on_append {
            self.flush().await?;
        } else if self.buffer.len() >= self.write_buffer_bytes {
            self.write_buffer().await?;
        }
        Ok(position)
    }

    /// Writes buffered bytes and fsyncs.
    ///
    /// # Errors
    /// Returns an error if the write or sync fails.
    pub async fn flush(&mut self) -> StorageResult<()> {
        self.write_buffer().await?;
        if self.flushed_offset != self.dirty_offset {
            self.file.sync().await?;
            self.flushed_offset = self.dirty_offset;
        }
        Ok(())
    }

    async fn write_buffer(&mut self) -> StorageResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.file.write_at(self.file_size, &self.buffer).await?;
        self.file_size += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    /// Flushes, persists the index, and stops accepting appends.
    ///
    /// # Errors
    /// Returns an error if flushing or writing the index fails.
    pub async fn close(&mut self) -> StorageResult<()> {
        self.flush().await?;
        if !self.closed {
            let encoded = self.index.encode(self.file_size);
            let path = index_path(&self.path);
            let file = self.storage.open(&path).await?;
            file.truncate(0).await?;
            file.write_at(0, &encoded).await?;
            file.sync().await?;
            self.closed = true;
            debug!(segment = %self.name, size = self.file_size, "closed segment");
        }
        Ok(())
    }

    /// Removes every batch at or after `offset`.
    ///
    /// `offset` must be the base offset of a batch (or past the end, which is
    /// a no-op). The segment reopens for appends afterwards.
    ///
    /// # Errors
    /// Returns [`StorageError::TruncateMidBatch`] if `offset` lies inside a
    /// batch; nothing is changed in that case.
    pub async fn truncate(&mut self, offset: Offset) -> StorageResult<()> {
        if offset >= self.next_offset() {
            return Ok(());
        }
        let (position, prev_last) = if offset <= self.base_offset() {
            (0, None)
        } else {
            self.locate_truncation_point(offset).await?
        };

        self.write_buffer().await?;
        self.file.truncate(position).await?;
        self.file.sync().await?;
        self.file_size = position;
        self.index.truncate(offset);
        self.dirty_offset = prev_last;
        self.flushed_offset = self.flushed_offset.min(prev_last);
        self.closed = false;
        debug!(segment = %self.name, %offset, position, "truncated segment");
        Ok(())
    }

    /// Finds the position of the first batch at or after `offset` and the
    /// last offset before it. Rejects an `offset` inside a batch.
    async fn locate_truncation_point(
        &self,
        offset: Offset,
    ) -> StorageResult<(u64, Option<Offset>)> {
        // Start from a sample strictly before the target so the batch
        // preceding it is seen.
        let mut pos = offset
            .prev()
            .and_then(|o| self.index.lookup(o))
            .map_or(0, |e| e.position);
        let mut prev_last = None;
        while let Some(header) = self.header_at(pos).await? {
            if header.base_offset >= offset {
                return Ok((pos, prev_last));
            }
            if header.last_offset() >= offset {
                return Err(StorageError::TruncateMidBatch {
                    offset,
                    batch_base: header.base_offset,
                    batch_last: header.last_offset(),
                });
            }
            prev_last = Some(header.last_offset());
            pos += u64::from(header.size_bytes);
        }
        Ok((self.size_bytes(), prev_last))
    }

    /// Deletes the data and index files.
    ///
    /// # Errors
    /// Returns an error if the data file cannot be removed.
    pub async fn remove(self) -> StorageResult<()> {
        let index = index_path(&self.path);
        if self.storage.exists(&index).await? {
            self.storage.remove(&index).await?;
        }
        drop(self.file);
        self.storage.remove(&self.path).await?;
        debug!(segment = %self.name, "removed segment");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Reads batches for `config`, stopping once `budget` bytes have been
    /// gathered, at `config.max_offset`, or at the deadline.
    ///
    /// Batches entirely below `config.start_offset` are skipped.
    ///
    /// # Errors
    /// Returns [`StorageError::Corruption`] if a batch fails verification.
    pub async fn read(
        &self,
        config: &ReaderConfig,
        budget: usize,
    ) -> StorageResult<Vec<RecordBatch>> {
        let mut batches = Vec::new();
        let mut gathered = 0usize;
        let mut pos = self
            .index
            .lookup(config.start_offset)
            .map_or(0, |e| e.position);

        while let Some(header) = self.header_at(pos).await? {
            if header.base_offset > config.max_offset {
                break;
            }
            if config.deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            let size = u64::from(header.size_bytes);
            let wanted = header.last_offset() >= config.start_offset
                && config.type_filter.map_or(true, |t| t == header.batch_type);
            if wanted {
                let batch = self.batch_at(pos, header).await?;
                gathered += batch.size_bytes() as usize;
                batches.push(batch);
                if gathered >= budget {
                    break;
                }
            }
            pos += size;
        }
        Ok(batches)
    }

    /// Reads every batch with its position.
    ///
    /// # Errors
    /// Returns [`StorageError::Corruption`] if a batch fails verification.
    pub async fn read_all(&self) -> StorageResult<Vec<(u64, RecordBatch)>> {
        let mut out = Vec::new();
        let mut pos = 0;
        while let Some(header) = self.header_at(pos).await? {
            let batch = self.batch_at(pos, header).await?;
            out.push((pos, batch));
            pos += u64::from(header.size_bytes);
        }
        Ok(out)
    }

    /// Decodes the header at `pos`, or `None` at the end of the segment.
    async fn header_at(&self, pos: u64) -> StorageResult<Option<RecordBatchHeader>> {
        if pos >= self.size_bytes() {
            return Ok(None);
        }
        let bytes = self.read_range(pos, BATCH_HEADER_SIZE).await?;
        RecordBatchHeader::decode(&bytes)
            .map(Some)
            .map_err(|source| self.corruption(pos, source))
    }

    async fn batch_at(&self, pos: u64, header: RecordBatchHeader) -> StorageResult<RecordBatch> {
        let size = header.size_bytes as usize;
        let bytes = self.read_range(pos, size).await?;
        if bytes.len() < size {
            return Err(self.corruption(
                pos,
                keel_core::CoreError::Truncated {
                    needed: size,
                    available: bytes.len(),
                },
            ));
        }
        RecordBatch::from_parts(header, IoBuf::from(bytes.slice(BATCH_HEADER_SIZE..)))
            .map_err(|source| self.corruption(pos, source))
    }

    /// Reads `len` bytes at `pos`, stitching file and write-behind buffer.
    #[allow(clippy::cast_possible_truncation)] // Positions bounded by segment size limits.
    async fn read_range(&self, pos: u64, len: usize) -> StorageResult<Bytes> {
        let end = (pos + len as u64).min(self.size_bytes());
        if end <= self.file_size {
            return self.file.read_at(pos, (end - pos) as usize).await;
        }
        let buffered_from = pos.saturating_sub(self.file_size) as usize;
        let buffered_to = (end - self.file_size) as usize;
        if pos >= self.file_size {
            return Ok(Bytes::copy_from_slice(&self.buffer[buffered_from..buffered_to]));
        }
        let head = self
            .file
            .read_at(pos, (self.file_size - pos) as usize)
            .await?;
        let mut out = BytesMut::with_capacity(head.len() + buffered_to);
        out.extend_from_slice(&head);
        out.extend_from_slice(&self.buffer[..buffered_to]);
        Ok(out.freeze())
    }

    /// Completes the in-memory state of an opened segment by walking batch
    /// headers from the last usable index sample.
    #[allow(clippy::cast_possible_truncation)] // Positions bounded by segment size limits.
    async fn rebuild_tail(&mut self) -> StorageResult<()> {
        let mut pos = 0;
        if let Some(sample) = self.index.lookup(Offset::new(u64::MAX)) {
            // The walk re-adds this sample.
            pos = sample.position;
            self.index.truncate(sample.offset);
        }
        let mut last = None;
        while let Some(header) = self.header_at(pos).await? {
            let size = u64::from(header.size_bytes);
            if pos + size > self.file_size {
                return Err(self.corruption(
                    pos,
                    keel_core::CoreError::Truncated {
                        needed: header.size_bytes as usize,
                        available: (self.file_size - pos) as usize,
                    },
                ));
            }
            self.index
                .maybe_track(header.base_offset, pos, size, header.max_timestamp);
            last = Some(header.last_offset());
            pos += size;
        }
        self.dirty_offset = last;
        Ok(())
    }

    fn corruption(&self, position: u64, source: keel_core::CoreError) -> StorageError {
        StorageError::Corruption {
            segment: self.name.to_string(),
            position,
            source,
        }
    }
}

/// Returns the header and size of a fully valid batch at `pos` in `data`.
fn valid_batch_at(data: &Bytes, pos: usize) -> Option<(RecordBatchHeader, usize)> {
    let rest = data.get(pos..)?;
    let header = RecordBatchHeader::decode(rest).ok()?;
    let size = header.size_bytes as usize;
    if rest.len() < size {
        return None;
    }
    let body = IoBuf::from(data.slice(pos + BATCH_HEADER_SIZE..pos + size));
    RecordBatch::from_parts(header, body).ok()?;
    Some((header, size))
}

async fn load_index(
    storage: &dyn Storage,
    path: &Path,
    name: &SegmentName,
    config: &LogConfig,
    file_size: u64,
) -> SparseIndex {
    let fresh = SparseIndex::new(name.base_offset, config.index_interval_bytes);
    let path = index_path(path);
    let Ok(true) = storage.exists(&path).await else {
        return fresh;
    };
    let Ok(file) = storage.open(&path).await else {
        return fresh;
    };
    let Ok(data) = file.read_all().await else {
        return fresh;
    };
    match SparseIndex::decode(&data, name.base_offset, config.index_interval_bytes) {
        Some((index, covered)) if covered == file_size => index,
        _ => {
            debug!(segment = %name, "index missing or stale, rebuilding");
            fresh
        }
    }
}
