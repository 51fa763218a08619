//! Log and log manager configuration.

use std::path::PathBuf;
use std::time::Duration;

use keel_core::{Offset, Timestamp};

use crate::limits::{
    INDEX_INTERVAL_BYTES_DEFAULT, SEGMENT_SIZE_BYTES_DEFAULT, SEGMENT_SIZE_BYTES_MAX,
    SEGMENT_SIZE_BYTES_MIN, WRITE_BUFFER_BYTES_DEFAULT,
};

/// How old data leaves a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    /// Whole closed segments are deleted once past the retention bounds.
    #[default]
    Delete,
    /// Batches whose every keyed record has a newer value are removed.
    Compact,
    /// Both, retention first.
    CompactAndDelete,
}

impl CleanupPolicy {
    /// Returns true if retention deletion applies.
    #[must_use]
    pub const fn deletes(self) -> bool {
        matches!(self, Self::Delete | Self::CompactAndDelete)
    }

    /// Returns true if key compaction applies.
    #[must_use]
    pub const fn compacts(self) -> bool {
        matches!(self, Self::Compact | Self::CompactAndDelete)
    }
}

/// Per-log configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// The active segment rolls once it reaches this size.
    pub max_segment_bytes: u64,
    /// A sparse index entry is recorded every this many bytes.
    pub index_interval_bytes: u64,
    /// Appends are buffered up to this many bytes before being written.
    pub write_buffer_bytes: usize,
    /// Flush and fsync after every append.
    pub sync_on_append: bool,
    /// Cleanup policy applied by `compact`.
    pub cleanup_policy: CleanupPolicy,
    /// Keep at most this many bytes.
    pub retention_bytes: Option<u64>,
    /// Keep data for at most this long.
    pub retention: Option<Duration>,
}

impl LogConfig {
    /// Creates the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_segment_bytes: SEGMENT_SIZE_BYTES_DEFAULT,
            index_interval_bytes: INDEX_INTERVAL_BYTES_DEFAULT,
            write_buffer_bytes: WRITE_BUFFER_BYTES_DEFAULT,
            sync_on_append: false,
            cleanup_policy: CleanupPolicy::Delete,
            retention_bytes: None,
            retention: None,
        }
    }

    /// Sets the segment roll size.
    #[must_use]
    pub const fn with_max_segment_bytes(mut self, bytes: u64) -> Self {
        self.max_segment_bytes = bytes;
        self
    }

    /// Sets the sparse index interval.
    #[must_use]
    pub const fn with_index_interval_bytes(mut self, bytes: u64) -> Self {
        self.index_interval_bytes = bytes;
        self
    }

    /// Sets the write-behind buffer size.
    #[must_use]
    pub const fn with_write_buffer_bytes(mut self, bytes: usize) -> Self {
        self.write_buffer_bytes = bytes;
        self
    }

    /// Enables or disables fsync on every append.
    #[must_use]
    pub const fn with_sync_on_append(mut self, sync: bool) -> Self {
        self.sync_on_append = sync;
        self
    }

    /// Sets the cleanup policy.
    #[must_use]
    pub const fn with_cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup_policy = policy;
        self
    }

    /// Sets the byte retention bound.
    #[must_use]
    pub const fn with_retention_bytes(mut self, bytes: u64) -> Self {
        self.retention_bytes = Some(bytes);
        self
    }

    /// Sets the time retention bound.
    #[must_use]
    pub const fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if a bound is out of range.
    pub const fn validate(&self) -> Result<(), &'static str> {
        if self.max_segment_bytes < SEGMENT_SIZE_BYTES_MIN {
            return Err("max_segment_bytes below minimum");
        }
        if self.max_segment_bytes > SEGMENT_SIZE_BYTES_MAX {
            return Err("max_segment_bytes above maximum");
        }
        if self.index_interval_bytes == 0 {
            return Err("index_interval_bytes must be positive");
        }
        if self.write_buffer_bytes == 0 {
            return Err("write_buffer_bytes must be positive");
        }
        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters of one `compact` pass.
#[derive(Debug, Clone, Copy)]
pub struct CompactionConfig {
    /// Which cleanup to run.
    pub policy: CleanupPolicy,
    /// Keep at most this many bytes.
    pub retention_bytes: Option<u64>,
    /// Keep data for at most this long relative to `now`.
    pub retention: Option<Duration>,
    /// Nothing above this offset is collected. `None` collects nothing.
    pub max_collectible_offset: Option<Offset>,
    /// Clock reading used for time retention.
    pub now: Timestamp,
}

impl CompactionConfig {
    /// Derives a pass from a log's configuration.
    #[must_use]
    pub const fn from_log_config(
        config: &LogConfig,
        max_collectible_offset: Option<Offset>,
        now: Timestamp,
    ) -> Self {
        Self {
            policy: config.cleanup_policy,
            retention_bytes: config.retention_bytes,
            retention: config.retention,
            max_collectible_offset,
            now,
        }
    }
}

/// Configuration for a [`crate::LogManager`].
#[derive(Debug, Clone)]
pub struct LogManagerConfig {
    /// Root under which `<ns>/<topic>/<partition>` directories live.
    pub base_dir: PathBuf,
    /// Configuration for logs managed without an explicit one.
    pub default_log_config: LogConfig,
    /// Interval of the background flush/compaction task.
    pub housekeeping_interval: Duration,
}

impl LogManagerConfig {
    /// Creates a configuration rooted at `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            default_log_config: LogConfig::new(),
            housekeeping_interval: Duration::from_secs(10),
        }
    }

    /// Sets the default log configuration.
    #[must_use]
    pub fn with_default_log_config(mut self, config: LogConfig) -> Self {
        self.default_log_config = config;
        self
    }

    /// Sets the housekeeping interval.
    #[must_use]
    pub const fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }
}
