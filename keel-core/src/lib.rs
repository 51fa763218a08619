//! Keel Core - identifiers, buffers and record batches for the keel log.
//!
//! This crate holds the types every other keel crate speaks: strongly-typed
//! ids, offsets and NTPs, the fragmented [`IoBuf`] that carries bytes through
//! the data path, and the [`RecordBatch`] framing stored on disk and shipped
//! between replicas.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: a `TermId` cannot be passed where a `NodeId` is expected
//! - **Explicit limits**: every buffer and batch has a bounded maximum
//! - **Explicit sharing**: byte storage is shared only through `share()`
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod iobuf;
pub mod limits;
mod record;
mod types;

pub use error::{ChecksumKind, CoreError, CoreResult};
pub use iobuf::{AllocationSize, IoBuf, IoBufParser};
pub use record::{
    BatchType, Compression, Record, RecordBatch, RecordBatchBuilder, RecordBatchHeader,
    RecordHeader, Timestamp,
};
pub use types::{GroupId, NodeId, Ntp, Offset, PartitionId, TermId};
