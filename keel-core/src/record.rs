//! Records and record batches.
//!
//! A [`RecordBatch`] is the atomic unit of storage and replication: a fixed
//! header followed by a body holding either encoded [`Record`]s or an opaque
//! compressed payload. Bodies are [`IoBuf`]s, so decoding a batch read from
//! disk hands out keys and values that share the read buffer.
//!
//! # Header Format
//!
//! All integers little-endian, 69 bytes total:
//!
//! ```text
//! header_crc u32 | size_bytes u32 | base_offset u64 | batch_type u8 |
//! attributes u16 | last_offset_delta u32 | first_timestamp i64 |
//! max_timestamp i64 | producer_id i64 | producer_epoch i16 |
//! base_sequence i32 | record_count u32 | term u64 | crc u32
//! ```
//!
//! `header_crc` covers the 65 bytes that follow it. `crc` covers the body.
//!
//! # Record Format
//!
//! ```text
//! length u32 | timestamp_delta i64 | offset_delta u32 |
//! key_len i32 (-1 = null) | key | value_len u32 | value |
//! header_count u32 | (key_len u32 | key | value_len u32 | value)*
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ChecksumKind, CoreError, CoreResult};
use crate::iobuf::{IoBuf, IoBufParser};
use crate::limits::{
    BATCH_HEADER_SIZE, BATCH_RECORD_COUNT_MAX, BATCH_SIZE_BYTES_MAX, RECORD_HEADER_COUNT_MAX,
};
use crate::types::{Offset, TermId};

/// Attribute bits holding the compression codec.
const COMPRESSION_MASK: u16 = 0b111;

// ----------------------------------------------------------------------------
// Scalars
// ----------------------------------------------------------------------------

/// Timestamp in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from milliseconds since Unix epoch.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since Unix epoch.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Returns the current wall-clock time.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Timestamps won't overflow i64 for centuries.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as i64)
    }

    /// Creates a timestamp representing "no timestamp".
    #[must_use]
    pub const fn none() -> Self {
        Self(-1)
    }

    /// Returns true if this represents "no timestamp".
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 < 0
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::none()
    }
}

/// Compression codec of a batch body.
///
/// The log never decompresses; compressed bodies are carried opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    /// No compression.
    #[default]
    None = 0,
    /// Gzip compression.
    Gzip = 1,
    /// Snappy compression.
    Snappy = 2,
    /// LZ4 compression.
    Lz4 = 3,
    /// Zstd compression.
    Zstd = 4,
}

impl Compression {
    /// Creates a compression from a raw byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            2 => Some(Self::Snappy),
            3 => Some(Self::Lz4),
            4 => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// What a batch carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BatchType {
    /// Client data.
    #[default]
    RaftData = 1,
    /// Group configuration written by a newly elected leader.
    RaftConfiguration = 2,
    /// Empty entry a new leader writes so its own term can commit.
    Checkpoint = 3,
}

impl BatchType {
    /// Creates a batch type from a raw byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::RaftData),
            2 => Some(Self::RaftConfiguration),
            3 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Records
// ----------------------------------------------------------------------------

/// A key/value header attached to a record.
#[derive(Debug, PartialEq, Eq)]
pub struct RecordHeader {
    /// Header key.
    pub key: IoBuf,
    /// Header value.
    pub value: IoBuf,
}

impl RecordHeader {
    /// Creates a new header.
    #[must_use]
    pub fn new(key: impl Into<IoBuf>, value: impl Into<IoBuf>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One logical message.
#[derive(Debug, PartialEq, Eq)]
pub struct Record {
    /// Milliseconds since the batch's first timestamp.
    pub timestamp_delta: i64,
    /// Position relative to the batch base offset.
    pub offset_delta: u32,
    /// Optional key, used for compaction.
    pub key: Option<IoBuf>,
    /// Payload.
    pub value: IoBuf,
    /// Headers, in order.
    pub headers: Vec<RecordHeader>,
}

impl Record {
    /// Returns the encoded size of this record, including its length prefix.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        let key = self.key.as_ref().map_or(0, IoBuf::size_bytes);
        let headers: usize = self
            .headers
            .iter()
            .map(|h| 8 + h.key.size_bytes() + h.value.size_bytes())
            .sum();
        4 + 8 + 4 + 4 + key + 4 + self.value.size_bytes() + 4 + headers
    }

    /// Deep-copies the record.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self {
            timestamp_delta: self.timestamp_delta,
            offset_delta: self.offset_delta,
            key: self.key.as_ref().map(IoBuf::copy),
            value: self.value.copy(),
            headers: self
                .headers
                .iter()
                .map(|h| RecordHeader {
                    key: h.key.copy(),
                    value: h.value.copy(),
                })
                .collect(),
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)] // Sizes bounded by batch limits.
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le((self.encoded_size() - 4) as u32);
        buf.put_i64_le(self.timestamp_delta);
        buf.put_u32_le(self.offset_delta);
        match &self.key {
            Some(key) => {
                buf.put_i32_le(key.size_bytes() as i32);
                key.write_to(buf);
            }
            None => buf.put_i32_le(-1),
        }
        buf.put_u32_le(self.value.size_bytes() as u32);
        self.value.write_to(buf);
        buf.put_u32_le(self.headers.len() as u32);
        for header in &self.headers {
            buf.put_u32_le(header.key.size_bytes() as u32);
            header.key.write_to(buf);
            buf.put_u32_le(header.value.size_bytes() as u32);
            header.value.write_to(buf);
        }
    }

    #[allow(clippy::cast_sign_loss)] // Checked non-negative before the cast.
    fn decode(parser: &mut IoBufParser) -> CoreResult<Self> {
        parser.ensure(4)?;
        let length = parser.get_u32_le() as usize;
        parser.ensure(length)?;
        let mut body = parser.read_iobuf(length)?.into_parser();

        body.ensure(8 + 4 + 4)?;
        let timestamp_delta = body.get_i64_le();
        let offset_delta = body.get_u32_le();
        let key_len = body.get_i32_le();
        let key = match key_len {
            -1 => None,
            n if n < 0 => {
                return Err(CoreError::InvalidField {
                    field: "key_len",
                    reason: "negative length other than -1",
                })
            }
            n => Some(body.read_iobuf(n as usize)?),
        };
        body.ensure(4)?;
        let value_len = body.get_u32_le() as usize;
        let value = body.read_iobuf(value_len)?;

        body.ensure(4)?;
        let header_count = body.get_u32_le();
        if header_count > RECORD_HEADER_COUNT_MAX {
            return Err(CoreError::LimitExceeded {
                limit: "record header count",
                max: u64::from(RECORD_HEADER_COUNT_MAX),
                actual: u64::from(header_count),
            });
        }
        let mut headers = Vec::with_capacity(header_count as usize);
        for _ in 0..header_count {
            body.ensure(4)?;
            let klen = body.get_u32_le() as usize;
            let key = body.read_iobuf(klen)?;
            body.ensure(4)?;
            let vlen = body.get_u32_le() as usize;
            let value = body.read_iobuf(vlen)?;
            headers.push(RecordHeader { key, value });
        }
        if body.has_remaining() {
            return Err(CoreError::InvalidField {
                field: "record length",
                reason: "trailing bytes after record",
            });
        }

        Ok(Self {
            timestamp_delta,
            offset_delta,
            key,
            value,
            headers,
        })
    }
}

// ----------------------------------------------------------------------------
// Batch header
// ----------------------------------------------------------------------------

/// Fixed-size header of a record batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordBatchHeader {
    /// CRC32 of the header bytes following this field.
    pub header_crc: u32,
    /// Encoded size of the entire batch, header included.
    pub size_bytes: u32,
    /// Offset of the first record.
    pub base_offset: Offset,
    /// What the batch carries.
    pub batch_type: BatchType,
    /// Attribute bits; the low three hold the compression codec.
    pub attributes: u16,
    /// `record_count - 1`.
    pub last_offset_delta: u32,
    /// Timestamp of the first record.
    pub first_timestamp: Timestamp,
    /// Largest record timestamp.
    pub max_timestamp: Timestamp,
    /// Idempotent producer id, -1 if none.
    pub producer_id: i64,
    /// Idempotent producer epoch, -1 if none.
    pub producer_epoch: i16,
    /// Sequence number of the first record, -1 if none.
    pub base_sequence: i32,
    /// Number of records in the batch.
    pub record_count: u32,
    /// Raft term that produced the batch.
    pub term: TermId,
    /// CRC32 of the body.
    pub crc: u32,
}

impl RecordBatchHeader {
    /// Returns the offset of the last record.
    #[must_use]
    pub const fn last_offset(&self) -> Offset {
        self.base_offset.add(self.last_offset_delta as u64)
    }

    /// Returns the compression codec, defaulting to none for unknown bits.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Masked to three bits.
    pub const fn compression(&self) -> Compression {
        match Compression::from_byte((self.attributes & COMPRESSION_MASK) as u8) {
            Some(c) => c,
            None => Compression::None,
        }
    }

    /// Computes the header checksum from the current field values.
    #[must_use]
    pub fn compute_header_crc(&self) -> u32 {
        let mut buf = BytesMut::with_capacity(BATCH_HEADER_SIZE);
        self.encode_fields(&mut buf);
        crc32fast::hash(&buf)
    }

    /// Encodes the header, `header_crc` first.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.header_crc);
        self.encode_fields(buf);
    }

    fn encode_fields(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.size_bytes);
        buf.put_u64_le(self.base_offset.get());
        buf.put_u8(self.batch_type as u8);
        buf.put_u16_le(self.attributes);
        buf.put_u32_le(self.last_offset_delta);
        buf.put_i64_le(self.first_timestamp.as_millis());
        buf.put_i64_le(self.max_timestamp.as_millis());
        buf.put_i64_le(self.producer_id);
        buf.put_i16_le(self.producer_epoch);
        buf.put_i32_le(self.base_sequence);
        buf.put_u32_le(self.record_count);
        buf.put_u64_le(self.term.get());
        buf.put_u32_le(self.crc);
    }

    /// Decodes and verifies a header from the first [`BATCH_HEADER_SIZE`]
    /// bytes of `data`.
    ///
    /// # Errors
    /// Returns an error if `data` is short, the header checksum does not
    /// match, or a field is out of range.
    pub fn decode(mut data: &[u8]) -> CoreResult<Self> {
        if data.len() < BATCH_HEADER_SIZE {
            return Err(CoreError::Truncated {
                needed: BATCH_HEADER_SIZE,
                available: data.len(),
            });
        }
        let computed = crc32fast::hash(&data[4..BATCH_HEADER_SIZE]);

        let header_crc = data.get_u32_le();
        let size_bytes = data.get_u32_le();
        let base_offset = Offset::new(data.get_u64_le());
        if header_crc != computed {
            return Err(CoreError::ChecksumMismatch {
                kind: ChecksumKind::Header,
                base_offset: base_offset.get(),
                expected: header_crc,
                actual: computed,
            });
        }
        let batch_type = BatchType::from_byte(data.get_u8()).ok_or(CoreError::InvalidField {
            field: "batch_type",
            reason: "unknown batch type",
        })?;
        let attributes = data.get_u16_le();
        let last_offset_delta = data.get_u32_le();
        let first_timestamp = Timestamp::from_millis(data.get_i64_le());
        let max_timestamp = Timestamp::from_millis(data.get_i64_le());
        let producer_id = data.get_i64_le();
        let producer_epoch = data.get_i16_le();
        let base_sequence = data.get_i32_le();
        let record_count = data.get_u32_le();
        let term = TermId::new(data.get_u64_le());
        let crc = data.get_u32_le();

        if (size_bytes as usize) < BATCH_HEADER_SIZE || size_bytes > BATCH_SIZE_BYTES_MAX {
            return Err(CoreError::InvalidField {
                field: "size_bytes",
                reason: "outside header size and batch limit",
            });
        }
        if record_count == 0 || record_count > BATCH_RECORD_COUNT_MAX {
            return Err(CoreError::InvalidField {
                field: "record_count",
                reason: "must be between 1 and the batch record limit",
            });
        }
        if last_offset_delta != record_count - 1 {
            return Err(CoreError::InvalidField {
                field: "last_offset_delta",
                reason: "must equal record_count - 1",
            });
        }

        Ok(Self {
            header_crc,
            size_bytes,
            base_offset,
            batch_type,
            attributes,
            last_offset_delta,
            first_timestamp,
            max_timestamp,
            producer_id,
            producer_epoch,
            base_sequence,
            record_count,
            term,
            crc,
        })
    }
}

// ----------------------------------------------------------------------------
// Batch
// ----------------------------------------------------------------------------

/// An immutable batch of records.
///
/// Not `Clone`: take a second handle with [`RecordBatch::share`] or
/// [`RecordBatch::copy`].
#[derive(Debug, PartialEq, Eq)]
pub struct RecordBatch {
    header: RecordBatchHeader,
    body: IoBuf,
}

impl RecordBatch {
    /// Creates a batch around an already compressed body.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidField`] if `compression` is `None` or
    /// `record_count` is outside `1..=BATCH_RECORD_COUNT_MAX`, and
    /// [`CoreError::LimitExceeded`] if the batch would exceed
    /// `BATCH_SIZE_BYTES_MAX`.
    #[allow(clippy::cast_possible_truncation)] // Checked against BATCH_SIZE_BYTES_MAX.
    pub fn compressed(
        compression: Compression,
        record_count: u32,
        first_timestamp: Timestamp,
        max_timestamp: Timestamp,
        payload: IoBuf,
    ) -> CoreResult<Self> {
        if compression == Compression::None {
            return Err(CoreError::InvalidField {
                field: "attributes",
                reason: "compressed batch needs a codec",
            });
        }
        if record_count == 0 || record_count > BATCH_RECORD_COUNT_MAX {
            return Err(CoreError::InvalidField {
                field: "record_count",
                reason: "must be between 1 and the batch record limit",
            });
        }
        let size = BATCH_HEADER_SIZE + payload.size_bytes();
        if size > BATCH_SIZE_BYTES_MAX as usize {
            return Err(CoreError::LimitExceeded {
                limit: "batch size",
                max: u64::from(BATCH_SIZE_BYTES_MAX),
                actual: size as u64,
            });
        }
        let mut header = RecordBatchHeader {
            header_crc: 0,
            size_bytes: size as u32,
            base_offset: Offset::ZERO,
            batch_type: BatchType::RaftData,
            attributes: compression as u16,
            last_offset_delta: record_count - 1,
            first_timestamp,
            max_timestamp,
            producer_id: -1,
            producer_epoch: -1,
            base_sequence: -1,
            record_count,
            term: TermId::new(0),
            crc: body_crc(&payload),
        };
        header.header_crc = header.compute_header_crc();
        Ok(Self {
            header,
            body: payload,
        })
    }

    /// Returns the header.
    #[must_use]
    pub const fn header(&self) -> &RecordBatchHeader {
        &self.header
    }

    /// Returns the encoded body.
    #[must_use]
    pub const fn body(&self) -> &IoBuf {
        &self.body
    }

    /// Offset of the first record.
    #[must_use]
    pub const fn base_offset(&self) -> Offset {
        self.header.base_offset
    }

    /// Offset of the last record.
    #[must_use]
    pub const fn last_offset(&self) -> Offset {
        self.header.last_offset()
    }

    /// Raft term that produced the batch.
    #[must_use]
    pub const fn term(&self) -> TermId {
        self.header.term
    }

    /// Number of records.
    #[must_use]
    pub const fn record_count(&self) -> u32 {
        self.header.record_count
    }

    /// Encoded size, header included.
    #[must_use]
    pub const fn size_bytes(&self) -> u32 {
        self.header.size_bytes
    }

    /// Returns true if the body is an opaque compressed payload.
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        !matches!(self.header.compression(), Compression::None)
    }

    /// Stamps the batch with its final base offset and term, recomputing the
    /// header checksum. The body is offset-relative, so its CRC is unchanged.
    pub fn assign(&mut self, base_offset: Offset, term: TermId) {
        self.header.base_offset = base_offset;
        self.header.term = term;
        self.header.header_crc = self.header.compute_header_crc();
    }

    /// Decodes the records of an uncompressed batch without copying their
    /// bytes.
    ///
    /// # Errors
    /// Returns an error for compressed batches and malformed bodies.
    pub fn records(&mut self) -> CoreResult<Vec<Record>> {
        if self.is_compressed() {
            return Err(CoreError::InvalidField {
                field: "attributes",
                reason: "records of a compressed batch are opaque",
            });
        }
        let mut parser = self.body.share_all().into_parser();
        let mut records = Vec::with_capacity(self.header.record_count as usize);
        while parser.has_remaining() {
            records.push(Record::decode(&mut parser)?);
        }
        if records.len() != self.header.record_count as usize {
            return Err(CoreError::InvalidField {
                field: "record_count",
                reason: "does not match decoded records",
            });
        }
        Ok(records)
    }

    /// Returns a second handle sharing this batch's body.
    pub fn share(&mut self) -> Self {
        Self {
            header: self.header,
            body: self.body.share_all(),
        }
    }

    /// Returns a deep copy.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self {
            header: self.header,
            body: self.body.copy(),
        }
    }

    /// Appends the encoded batch to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.header.size_bytes as usize);
        self.header.encode(buf);
        self.body.write_to(buf);
    }

    /// Decodes one batch from the front of `parser`, verifying both CRCs.
    ///
    /// # Errors
    /// Returns an error if the input is short or damaged.
    pub fn decode(parser: &mut IoBufParser) -> CoreResult<Self> {
        parser.ensure(BATCH_HEADER_SIZE)?;
        let header_bytes = parser.copy_to_bytes(BATCH_HEADER_SIZE);
        let header = RecordBatchHeader::decode(&header_bytes)?;
        let body_len = header.size_bytes as usize - BATCH_HEADER_SIZE;
        let body = parser.read_iobuf(body_len)?;
        Self::from_parts(header, body)
    }

    /// Reassembles a batch from a decoded header and its body, verifying the
    /// body checksum.
    ///
    /// # Errors
    /// Returns [`CoreError::ChecksumMismatch`] if the body CRC differs.
    pub fn from_parts(header: RecordBatchHeader, body: IoBuf) -> CoreResult<Self> {
        if body.size_bytes() + BATCH_HEADER_SIZE != header.size_bytes as usize {
            return Err(CoreError::InvalidField {
                field: "size_bytes",
                reason: "does not match body length",
            });
        }
        let actual = body_crc(&body);
        if actual != header.crc {
            return Err(CoreError::ChecksumMismatch {
                kind: ChecksumKind::Body,
                base_offset: header.base_offset.get(),
                expected: header.crc,
                actual,
            });
        }
        Ok(Self { header, body })
    }
}

fn body_crc(body: &IoBuf) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for frag in body.fragments() {
        hasher.update(frag);
    }
    hasher.finalize()
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Builds an uncompressed [`RecordBatch`].
#[derive(Debug)]
pub struct RecordBatchBuilder {
    batch_type: BatchType,
    first_timestamp: Option<Timestamp>,
    producer_id: i64,
    producer_epoch: i16,
    base_sequence: i32,
    records: Vec<(Timestamp, Option<IoBuf>, IoBuf, Vec<RecordHeader>)>,
}

impl RecordBatchBuilder {
    /// Starts a batch of the given type.
    #[must_use]
    pub const fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            first_timestamp: None,
            producer_id: -1,
            producer_epoch: -1,
            base_sequence: -1,
            records: Vec::new(),
        }
    }

    /// Sets the idempotent producer identity.
    #[must_use]
    pub const fn with_producer(mut self, id: i64, epoch: i16, base_sequence: i32) -> Self {
        self.producer_id = id;
        self.producer_epoch = epoch;
        self.base_sequence = base_sequence;
        self
    }

    /// Adds a record stamped with the builder's first timestamp (or now).
    #[must_use]
    pub fn add_record(self, key: Option<IoBuf>, value: impl Into<IoBuf>) -> Self {
        let ts = self
            .records
            .first()
            .map_or_else(Timestamp::now, |(ts, ..)| *ts);
        self.add_record_at(ts, key, value, Vec::new())
    }

    /// Adds a record with an explicit timestamp and headers.
    #[must_use]
    pub fn add_record_at(
        mut self,
        timestamp: Timestamp,
        key: Option<IoBuf>,
        value: impl Into<IoBuf>,
        headers: Vec<RecordHeader>,
    ) -> Self {
        if self.first_timestamp.is_none() {
            self.first_timestamp = Some(timestamp);
        }
        self.records.push((timestamp, key, value.into(), headers));
        self
    }

    /// Returns the number of records added so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no record has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Encodes the records and seals the batch at offset zero, term zero.
    ///
    /// # Errors
    /// Returns an error if the batch is empty or exceeds the size limits.
    #[allow(clippy::cast_possible_truncation)] // Checked against limits first.
    pub fn build(self) -> CoreResult<RecordBatch> {
        if self.records.is_empty() {
            return Err(CoreError::InvalidField {
                field: "record_count",
                reason: "batch must hold at least one record",
            });
        }
        if self.records.len() as u64 > u64::from(BATCH_RECORD_COUNT_MAX) {
            return Err(CoreError::LimitExceeded {
                limit: "record count",
                max: u64::from(BATCH_RECORD_COUNT_MAX),
                actual: self.records.len() as u64,
            });
        }
        let record_count = self.records.len() as u32;
        let first = self.first_timestamp.unwrap_or_else(Timestamp::now);
        let mut max_ts = first;
        let mut body = BytesMut::new();
        for (delta, (ts, key, value, headers)) in self.records.into_iter().enumerate() {
            max_ts = max_ts.max(ts);
            let record = Record {
                timestamp_delta: ts.as_millis() - first.as_millis(),
                offset_delta: delta as u32,
                key,
                value,
                headers,
            };
            record.encode(&mut body);
        }
        let size = BATCH_HEADER_SIZE as u64 + body.len() as u64;
        if size > u64::from(BATCH_SIZE_BYTES_MAX) {
            return Err(CoreError::LimitExceeded {
                limit: "batch size",
                max: u64::from(BATCH_SIZE_BYTES_MAX),
                actual: size,
            });
        }

        let body = IoBuf::from(body.freeze());
        let mut header = RecordBatchHeader {
            header_crc: 0,
            size_bytes: size as u32,
            base_offset: Offset::ZERO,
            batch_type: self.batch_type,
            attributes: 0,
            last_offset_delta: record_count - 1,
            first_timestamp: first,
            max_timestamp: max_ts,
            producer_id: self.producer_id,
            producer_epoch: self.producer_epoch,
            base_sequence: self.base_sequence,
            record_count,
            term: TermId::new(0),
            crc: body_crc(&body),
        };
        header.header_crc = header.compute_header_crc();
        Ok(RecordBatch { header, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> RecordBatch {
        RecordBatchBuilder::new(BatchType::RaftData)
            .add_record_at(
                Timestamp::from_millis(1_000),
                Some(IoBuf::from("k1")),
                "v1",
                vec![RecordHeader::new("h", "x")],
            )
            .add_record_at(Timestamp::from_millis(1_005), None, "v2", Vec::new())
            .add_record_at(Timestamp::from_millis(1_002), Some(IoBuf::from("k3")), "", Vec::new())
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_sets_header_invariants() {
        let batch = sample_batch();
        let header = batch.header();
        assert_eq!(header.record_count, 3);
        assert_eq!(header.last_offset_delta, 2);
        assert_eq!(batch.last_offset(), Offset::new(2));
        assert_eq!(header.first_timestamp, Timestamp::from_millis(1_000));
        assert_eq!(header.max_timestamp, Timestamp::from_millis(1_005));
        assert_eq!(
            header.size_bytes as usize,
            BATCH_HEADER_SIZE + batch.body().size_bytes()
        );
        assert_eq!(header.header_crc, header.compute_header_crc());
    }

    #[test]
    fn test_records_decode_with_deltas() {
        let mut batch = sample_batch();
        let records = batch.records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key, Some(IoBuf::from("k1")));
        assert_eq!(records[0].headers[0], RecordHeader::new("h", "x"));
        assert_eq!(records[1].key, None);
        assert_eq!(records[1].timestamp_delta, 5);
        assert_eq!(records[2].offset_delta, 2);
        assert!(records[2].value.is_empty());
    }

    #[test]
    fn test_assign_changes_only_header_crc() {
        let mut batch = sample_batch();
        let body_crc = batch.header().crc;
        let header_crc = batch.header().header_crc;
        batch.assign(Offset::new(100), TermId::new(7));
        assert_eq!(batch.base_offset(), Offset::new(100));
        assert_eq!(batch.last_offset(), Offset::new(102));
        assert_eq!(batch.term(), TermId::new(7));
        assert_eq!(batch.header().crc, body_crc);
        assert_ne!(batch.header().header_crc, header_crc);
    }

    #[test]
    fn test_encode_decode_verifies_checksums() {
        let mut batch = sample_batch();
        batch.assign(Offset::new(5), TermId::new(2));
        let mut buf = BytesMut::new();
        batch.encode(&mut buf);
        assert_eq!(buf.len(), batch.size_bytes() as usize);

        let mut parser = IoBuf::from(buf.clone().freeze()).into_parser();
        let decoded = RecordBatch::decode(&mut parser).unwrap();
        assert_eq!(decoded, batch);

        // Flip one body byte.
        let mut damaged = buf.to_vec();
        let last = damaged.len() - 1;
        damaged[last] ^= 0xFF;
        let mut parser = IoBuf::from(damaged).into_parser();
        let err = RecordBatch::decode(&mut parser).unwrap_err();
        assert!(matches!(
            err,
            CoreError::ChecksumMismatch {
                kind: ChecksumKind::Body,
                base_offset: 5,
                ..
            }
        ));

        // Flip one header byte.
        let mut damaged = buf.to_vec();
        damaged[10] ^= 0xFF;
        let err = RecordBatchHeader::decode(&damaged).unwrap_err();
        assert!(matches!(
            err,
            CoreError::ChecksumMismatch {
                kind: ChecksumKind::Header,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_short_input() {
        let batch = sample_batch();
        let mut buf = BytesMut::new();
        batch.encode(&mut buf);
        buf.truncate(buf.len() - 3);
        let mut parser = IoBuf::from(buf.freeze()).into_parser();
        assert!(RecordBatch::decode(&mut parser).unwrap_err().is_corruption());
    }

    #[test]
    fn test_compressed_batch_is_opaque() {
        let mut batch = RecordBatch::compressed(
            Compression::Zstd,
            4,
            Timestamp::from_millis(1),
            Timestamp::from_millis(9),
            IoBuf::from("opaque-bytes"),
        )
        .unwrap();
        assert!(batch.is_compressed());
        assert_eq!(batch.header().compression(), Compression::Zstd);
        assert_eq!(batch.last_offset(), Offset::new(3));
        assert!(batch.records().is_err());
    }

    #[test]
    fn test_compressed_batch_rejects_bad_input() {
        let (first, max) = (Timestamp::from_millis(1), Timestamp::from_millis(2));
        let err = RecordBatch::compressed(Compression::None, 1, first, max, IoBuf::from("x"))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidField { field: "attributes", .. }));

        let err = RecordBatch::compressed(Compression::Lz4, 0, first, max, IoBuf::from("x"))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidField { field: "record_count", .. }));

        let oversized = IoBuf::from(vec![0u8; BATCH_SIZE_BYTES_MAX as usize]);
        let err = RecordBatch::compressed(Compression::Lz4, 1, first, max, oversized).unwrap_err();
        assert!(matches!(err, CoreError::LimitExceeded { limit: "batch size", .. }));
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_share_and_copy_preserve_content() {
        let mut batch = sample_batch();
        let shared = batch.share();
        let copied = batch.copy();
        assert_eq!(shared, batch);
        assert_eq!(copied, batch);
    }

    #[test]
    fn test_empty_builder_rejected() {
        assert!(RecordBatchBuilder::new(BatchType::RaftData).build().is_err());
    }
}
