//! Error types for keel core operations.
//!
//! All errors are explicit and typed. Every variant carries the position
//! or identifier needed to diagnose it.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Which checksum of a record batch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// The header checksum (`header_crc`).
    Header,
    /// The body checksum (`crc`).
    Body,
}

impl std::fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Header => f.write_str("header"),
            Self::Body => f.write_str("body"),
        }
    }
}

/// Errors raised while manipulating buffers and record batches.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A buffer range lies outside the buffer.
    #[error("range {pos}+{len} out of bounds for buffer of {size} bytes")]
    OutOfRange {
        /// Start of the requested range.
        pos: usize,
        /// Length of the requested range.
        len: usize,
        /// Actual buffer size.
        size: usize,
    },

    /// Input ended before a complete structure was read.
    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// A record batch checksum did not match its contents.
    #[error(
        "{kind} checksum mismatch in batch at offset {base_offset}: expected {expected:#010x}, got {actual:#010x}"
    )]
    ChecksumMismatch {
        /// Which checksum failed.
        kind: ChecksumKind,
        /// Base offset recorded in the batch header.
        base_offset: u64,
        /// Checksum stored in the header.
        expected: u32,
        /// Checksum computed from the bytes.
        actual: u32,
    },

    /// A structurally invalid field was decoded.
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// The field being decoded.
        field: &'static str,
        /// Why it is invalid.
        reason: &'static str,
    },

    /// A batch exceeds a configured bound.
    #[error("batch too large: {limit} is {actual}, max {max}")]
    LimitExceeded {
        /// Which bound was exceeded.
        limit: &'static str,
        /// The maximum allowed value.
        max: u64,
        /// The offending value.
        actual: u64,
    },
}

impl CoreError {
    /// Returns true if this error indicates damaged bytes rather than misuse.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::Truncated { .. } | Self::InvalidField { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::ChecksumMismatch {
            kind: ChecksumKind::Body,
            base_offset: 1024,
            expected: 0xDEAD_BEEF,
            actual: 0xCAFE_BABE,
        };
        let msg = err.to_string();
        assert!(msg.contains("body"));
        assert!(msg.contains("1024"));
        assert!(msg.contains("0xdeadbeef"));
    }

    #[test]
    fn test_is_corruption() {
        assert!(CoreError::Truncated {
            needed: 4,
            available: 1
        }
        .is_corruption());
        assert!(!CoreError::OutOfRange {
            pos: 0,
            len: 1,
            size: 0
        }
        .is_corruption());
    }
}
