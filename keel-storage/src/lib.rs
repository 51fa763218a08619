//! Keel Storage - segmented on-disk logs.
//!
//! Each partition (NTP) owns a [`Log`]: an ordered run of segment files under
//! `<base_dir>/<namespace>/<topic>/<partition>/`. Segments are named
//! `<base_offset>-<term>-v1.log` and hold raw record batches back to back.
//! The [`LogManager`] opens, recovers and tracks every log on a node.
//!
//! # Design Principles
//!
//! - **Checksums everywhere**: every batch read back is verified
//! - **Recover, don't guess**: a damaged tail is cut at the last valid batch
//! - **Explicit limits**: bounded segment sizes and buffers
//! - **Pluggable I/O**: all file access goes through [`Storage`] so tests
//!   can inject faults
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod compaction;
mod config;
mod error;
mod index;
mod log;
mod manager;
mod prefix;
mod reader;
mod segment;
mod storage;

pub use compaction::CompactionStats;
pub use config::{CleanupPolicy, CompactionConfig, LogConfig, LogManagerConfig};
pub use error::{StorageError, StorageResult};
pub use index::{IndexEntry, SparseIndex};
pub use log::{
    AppendConfig, AppendResult, Log, LogOffsets, RecoveryReport, STATE_FILE_EXTENSION, TEMP_SUFFIX,
};
pub use manager::LogManager;
pub use prefix::{PrefixMeta, PREFIX_FILE_NAME};
pub use reader::{LogReader, ReaderConfig};
pub use segment::{
    index_path, RecoveryOutcome, Segment, SegmentName, INDEX_SUFFIX, QUARANTINE_SUFFIX,
    SEGMENT_FORMAT_VERSION,
};
pub use storage::{FaultConfig, SimulatedStorage, Storage, StorageFile, TokioStorage};

/// Storage limits and defaults.
pub mod limits {
    /// Smallest allowed segment roll size in bytes (1 KB).
    pub const SEGMENT_SIZE_BYTES_MIN: u64 = 1024;

    /// Default segment roll size in bytes (1 GB).
    pub const SEGMENT_SIZE_BYTES_DEFAULT: u64 = 1024 * 1024 * 1024;

    /// Largest allowed segment roll size in bytes (2 GB). Index positions
    /// are u32.
    pub const SEGMENT_SIZE_BYTES_MAX: u64 = 2 * 1024 * 1024 * 1024;

    /// Default distance between sparse index samples in bytes (32 KB).
    pub const INDEX_INTERVAL_BYTES_DEFAULT: u64 = 32 * 1024;

    /// Default write-behind buffer size in bytes (64 KB).
    pub const WRITE_BUFFER_BYTES_DEFAULT: usize = 64 * 1024;

    /// Default byte budget of one read (1 MB).
    pub const READ_BYTES_DEFAULT: usize = 1024 * 1024;
}
