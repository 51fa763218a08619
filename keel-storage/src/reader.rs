//! Read configuration and the batch stream over a log.

use std::sync::Arc;

use keel_core::{BatchType, Offset, RecordBatch};
use tokio::time::Instant;

use crate::error::StorageResult;
use crate::limits::READ_BYTES_DEFAULT;
use crate::log::Log;

/// Bounds of one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    /// First wanted offset. Clamped up to the log start.
    pub start_offset: Offset,
    /// Last wanted offset, inclusive.
    pub max_offset: Offset,
    /// Stop once this many bytes are gathered. At least one batch is always
    /// returned when one qualifies.
    pub max_bytes: usize,
    /// Stop gathering once this instant passes.
    pub deadline: Option<Instant>,
    /// Only return batches of this type.
    pub type_filter: Option<BatchType>,
}

impl ReaderConfig {
    /// Reads from `start_offset` to the end of the log.
    #[must_use]
    pub const fn new(start_offset: Offset) -> Self {
        Self {
            start_offset,
            max_offset: Offset::new(u64::MAX),
            max_bytes: READ_BYTES_DEFAULT,
            deadline: None,
            type_filter: None,
        }
    }

    /// Sets the inclusive upper offset.
    #[must_use]
    pub const fn with_max_offset(mut self, max_offset: Offset) -> Self {
        self.max_offset = max_offset;
        self
    }

    /// Sets the byte budget.
    #[must_use]
    pub const fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Sets the deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Restricts the read to one batch type.
    #[must_use]
    pub const fn with_type_filter(mut self, batch_type: BatchType) -> Self {
        self.type_filter = Some(batch_type);
        self
    }
}

/// A pull-based stream of batch slices from one log.
///
/// Each call to [`LogReader::next_slice`] reads up to `max_bytes` and
/// advances past what it returned. The stream ends at `max_offset`, at the
/// end of the log, or when the log is truncated underneath it.
#[derive(Debug)]
pub struct LogReader {
    log: Arc<Log>,
    config: ReaderConfig,
    generation: u64,
    done: bool,
}

impl LogReader {
    pub(crate) const fn new(log: Arc<Log>, config: ReaderConfig, generation: u64) -> Self {
        Self {
            log,
            config,
            generation,
            done: false,
        }
    }

    /// Next offset the reader will ask for.
    #[must_use]
    pub const fn next_offset(&self) -> Offset {
        self.config.start_offset
    }

    /// Returns the next slice, or `None` once the stream has ended.
    ///
    /// # Errors
    /// Returns an error if the underlying read fails.
    pub async fn next_slice(&mut self) -> StorageResult<Option<Vec<RecordBatch>>> {
        if self.done {
            return Ok(None);
        }
        let (batches, generation) = self.log.read_with_generation(self.config).await?;
        if generation != self.generation || batches.is_empty() {
            self.done = true;
            return Ok(None);
        }
        if let Some(last) = batches.last() {
            let last = last.last_offset();
            if last >= self.config.max_offset {
                self.done = true;
            } else {
                self.config.start_offset = last.next();
            }
        }
        Ok(Some(batches))
    }
}
