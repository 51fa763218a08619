//! Storage error types.
//!
//! All errors are explicit and typed. Each variant names the offset, segment
//! or log it concerns.

use keel_core::{CoreError, Offset};
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in the segment store, logs and log manager.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error from the storage backend.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },

    /// A batch read back from a segment failed verification.
    #[error("corrupt batch in segment {segment} at position {position}: {source}")]
    Corruption {
        /// Segment file name.
        segment: String,
        /// Byte position of the batch within the segment.
        position: u64,
        /// What failed.
        source: CoreError,
    },

    /// Truncation was requested inside a batch.
    #[error("cannot truncate at offset {offset}: inside batch {batch_base}..={batch_last}")]
    TruncateMidBatch {
        /// Requested truncation point.
        offset: Offset,
        /// Base offset of the batch containing it.
        batch_base: Offset,
        /// Last offset of that batch.
        batch_last: Offset,
    },

    /// A follower-mode append did not continue the log.
    #[error("out of order append: batch starts at {actual}, log expects at least {expected}")]
    OutOfOrderAppend {
        /// First offset the log can accept.
        expected: Offset,
        /// Base offset of the rejected batch.
        actual: Offset,
    },

    /// An offset lies outside the retained range.
    #[error("offset {offset} out of range (start {start}, dirty {dirty:?})")]
    OffsetOutOfRange {
        /// Requested offset.
        offset: Offset,
        /// First retained offset.
        start: Offset,
        /// Last written offset.
        dirty: Option<Offset>,
    },

    /// Append was called with no batches.
    #[error("append requires at least one batch")]
    EmptyAppend,

    /// The log has been closed.
    #[error("log {ntp} is closed")]
    Closed {
        /// The closed log.
        ntp: String,
    },

    /// A metadata file failed its checksum or framing.
    #[error("invalid metadata file {path}: {reason}")]
    InvalidMetadata {
        /// The file.
        path: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Configuration rejected by `validate()`.
    #[error("invalid storage configuration: {reason}")]
    InvalidConfig {
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Several independent operations failed; all errors are kept.
    #[error("{} operations failed, first: {}", .0.len(), .0.first().map_or_else(String::new, ToString::to_string))]
    Multiple(Vec<StorageError>),
}

impl StorageError {
    /// Creates an I/O error.
    pub fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true if this error indicates damaged data.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::InvalidMetadata { .. })
    }

    /// Returns true if retrying the operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_context() {
        let err = StorageError::TruncateMidBatch {
            offset: Offset::new(12),
            batch_base: Offset::new(10),
            batch_last: Offset::new(14),
        };
        let msg = err.to_string();
        assert!(msg.contains("12"));
        assert!(msg.contains("10..=14"));
    }

    #[test]
    fn test_classification() {
        assert!(StorageError::io("write", "disk on fire").is_retryable());
        let corrupt = StorageError::Corruption {
            segment: "0-1-v1.log".to_string(),
            position: 0,
            source: CoreError::Truncated {
                needed: 69,
                available: 3,
            },
        };
        assert!(corrupt.is_corruption());
        assert!(!corrupt.is_retryable());
    }

    #[test]
    fn test_multiple_display() {
        let err = StorageError::Multiple(vec![
            StorageError::io("sync", "a"),
            StorageError::io("sync", "b"),
        ]);
        assert!(err.to_string().starts_with("2 operations failed"));
    }
}
