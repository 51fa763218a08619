//! Per-partition log.
//!
//! A [`Log`] owns the ordered segments of one NTP. Exactly one segment, the
//! last, is active for appends. Offsets are dense from `start_offset` to the
//! dirty offset, except where compaction removed whole batches.
//!
//! # Concurrency
//!
//! Appends, truncations and segment removal take the state write lock.
//! Reads take the read lock, so they run in parallel with each other and see
//! either all or none of a concurrent append. Compaction rewrites happen
//! outside the lock and are swapped in only if the segment set is unchanged.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use keel_core::{Ntp, Offset, RecordBatch, TermId};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LogConfig;
use crate::error::{StorageError, StorageResult};
use crate::prefix::{self, PrefixMeta, PREFIX_FILE_NAME};
use crate::reader::{LogReader, ReaderConfig};
use crate::segment::{index_path, Segment, SegmentName, INDEX_SUFFIX, QUARANTINE_SUFFIX};
use crate::storage::Storage;

/// Suffix of a compaction rewrite in progress.
pub(crate) const STAGING_SUFFIX: &str = ".staging";

/// Extension of state files that owners of a log keep in its directory,
/// such as a consensus group's vote. Recovery leaves them alone.
pub const STATE_FILE_EXTENSION: &str = ".state";

/// Suffix of a metadata file being replaced.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Returns true for files that belong in a log directory but are not
/// segments.
fn is_side_file(file_name: &str) -> bool {
    file_name == PREFIX_FILE_NAME
        || [INDEX_SUFFIX, QUARANTINE_SUFFIX, STATE_FILE_EXTENSION, TEMP_SUFFIX]
            .iter()
            .any(|suffix| file_name.ends_with(suffix))
}

/// What [`Log::open`] found and changed on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Files that are neither segments nor log metadata, left in place.
    pub ignored: Vec<PathBuf>,
    /// Segments renamed with the quarantine suffix, by original path.
    pub quarantined: Vec<PathBuf>,
    /// Segments and stale compaction output deleted.
    pub removed: Vec<PathBuf>,
    /// Bytes cut from the tail of the last segment.
    pub truncated_bytes: u64,
}

impl RecoveryReport {
    /// Returns true if recovery found the directory exactly as a clean
    /// shutdown leaves it.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.ignored.is_empty()
            && self.quarantined.is_empty()
            && self.removed.is_empty()
            && self.truncated_bytes == 0
    }
}

/// How `append` treats batch offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendConfig {
    /// Assign offsets and term (leader mode). Otherwise batches keep the
    /// offsets and terms they carry (follower mode).
    pub assign_offsets: bool,
    /// Term stamped on batches when assigning.
    pub term: TermId,
}

impl AppendConfig {
    /// Leader-mode append in `term`.
    #[must_use]
    pub const fn assign(term: TermId) -> Self {
        Self {
            assign_offsets: true,
            term,
        }
    }

    /// Follower-mode append of already numbered batches.
    #[must_use]
    pub const fn preassigned() -> Self {
        Self {
            assign_offsets: false,
            term: TermId::new(0),
        }
    }
}

/// What an append wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    /// Base offset of the first appended batch.
    pub base_offset: Offset,
    /// Last offset of the last appended batch.
    pub last_offset: Offset,
    /// Term of the last appended batch.
    pub last_term: TermId,
    /// Encoded bytes appended.
    pub byte_size: u64,
}

/// Offset bounds of a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOffsets {
    /// First retained offset.
    pub start_offset: Offset,
    /// Last offset known committed, if any.
    pub committed_offset: Option<Offset>,
    /// Last offset written, if any.
    pub dirty_offset: Option<Offset>,
    /// Term of the dirty offset.
    pub last_term: Option<TermId>,
}

pub(crate) struct LogState {
    pub(crate) segments: Vec<Segment>,
    pub(crate) start_offset: Offset,
    pub(crate) next_offset: Offset,
    pub(crate) committed_offset: Option<Offset>,
    /// Term of `start_offset - 1`.
    pub(crate) prefix_term: Option<TermId>,
    /// Bumped whenever the tail is cut, ending live readers.
    pub(crate) generation: u64,
    pub(crate) closed: bool,
}

impl LogState {
    pub(crate) const fn dirty_offset(&self) -> Option<Offset> {
        self.next_offset.prev()
    }

    /// Index of the segment that would hold `offset`.
    fn segment_index(&self, offset: Offset) -> Option<usize> {
        self.segments
            .partition_point(|s| s.base_offset() <= offset)
            .checked_sub(1)
    }

    fn term_at(&self, offset: Offset) -> Option<TermId> {
        if Some(offset) == self.start_offset.prev() {
            return self.prefix_term;
        }
        if offset < self.start_offset || Some(offset) > self.dirty_offset() {
            return None;
        }
        self.segment_index(offset).map(|i| self.segments[i].term())
    }

    fn offsets(&self) -> LogOffsets {
        let dirty_offset = self.dirty_offset();
        LogOffsets {
            start_offset: self.start_offset,
            committed_offset: self.committed_offset,
            dirty_offset,
            last_term: dirty_offset.and_then(|o| self.term_at(o)),
        }
    }
}

/// Renames a segment with the quarantine suffix and drops its index.
async fn quarantine(storage: &dyn Storage, path: &Path) -> StorageResult<()> {
    let mut target = path.as_os_str().to_owned();
    target.push(QUARANTINE_SUFFIX);
    storage.rename(path, Path::new(&target)).await?;
    let index = index_path(path);
    if storage.exists(&index).await? {
        storage.remove(&index).await?;
    }
    Ok(())
}

async fn remove_segment_files(storage: &dyn Storage, path: &Path) -> StorageResult<()> {
    let index = index_path(path);
    if storage.exists(&index).await? {
        storage.remove(&index).await?;
    }
    storage.remove(path).await
}

/// The log of one partition.
pub struct Log {
    ntp: Ntp,
    dir: PathBuf,
    storage: Arc<dyn Storage>,
    config: LogConfig,
    pub(crate) state: RwLock<LogState>,
    /// Serializes compaction, retention and prefix truncation.
    pub(crate) compaction_lock: Mutex<()>,
    recovery: RecoveryReport,
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("ntp", &self.ntp)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Log {
    /// Opens the log stored in `dir`, recovering it after a crash.
    ///
    /// Unknown files are logged and ignored. The last segment is verified
    /// batch by batch and cut at the last valid batch; if nothing in it is
    /// valid it is deleted when empty and renamed with a `.cannotrecover`
    /// suffix otherwise. A damaged closed segment is quarantined together
    /// with every later segment, so the log ends at the last intact segment
    /// before it. [`Log::recovery`] reports what was done.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or a file operation
    /// fails.
    pub async fn open(
        ntp: Ntp,
        dir: PathBuf,
        storage: Arc<dyn Storage>,
        config: LogConfig,
    ) -> StorageResult<Self> {
        config
            .validate()
            .map_err(|reason| StorageError::InvalidConfig { reason })?;
        storage.create_dir_all(&dir).await?;

        let mut report = RecoveryReport::default();
        let mut names = Vec::new();
        for path in storage.list_files(&dir).await? {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                warn!(%ntp, file = %path.display(), "ignoring non utf-8 file in log directory");
                report.ignored.push(path);
                continue;
            };
            if file_name.ends_with(STAGING_SUFFIX) {
                debug!(%ntp, file = file_name, "removing stale compaction output");
                storage.remove(&path).await?;
                report.removed.push(path);
                continue;
            }
            if is_side_file(file_name) {
                continue;
            }
            let Some(name) = SegmentName::parse(file_name) else {
                warn!(%ntp, file = file_name, "ignoring unrecognised file in log directory");
                report.ignored.push(path);
                continue;
            };
            if !name.is_supported() {
                warn!(%ntp, file = file_name, version = %name.version, "ignoring segment with unknown version");
                report.ignored.push(path);
                continue;
            }
            names.push((name, path));
        }
        names.sort();

        let prefix = prefix::load(storage.as_ref(), &dir).await?;
        let start_offset = prefix.map_or_else(
            || names.first().map_or(Offset::ZERO, |(n, _)| n.base_offset),
            |p| p.start_offset,
        );

        let mut segments = Vec::with_capacity(names.len());
        let mut names = names.into_iter().peekable();
        while let Some((name, path)) = names.next() {
            if let Some(next_base) = names.peek().map(|(n, _)| n.base_offset) {
                match Segment::open(Arc::clone(&storage), path.clone(), name.clone(), &config).await
                {
                    Ok(segment) if segment.next_offset() <= start_offset => {
                        // Left behind by a crash during prefix truncation.
                        segment.remove().await?;
                        report.removed.push(path);
                    }
                    Ok(segment) => segments.push(segment),
                    Err(e) if e.is_corruption() && next_base <= start_offset => {
                        warn!(%ntp, segment = %name, error = %e, "removing damaged segment below log start");
                        remove_segment_files(storage.as_ref(), &path).await?;
                        report.removed.push(path);
                    }
                    Err(e) if e.is_corruption() => {
                        warn!(
                            %ntp,
                            segment = %name,
                            error = %e,
                            later = names.len(),
                            "damaged closed segment, quarantining it and every later segment"
                        );
                        quarantine(storage.as_ref(), &path).await?;
                        report.quarantined.push(path);
                        for (_, later) in names.by_ref() {
                            quarantine(storage.as_ref(), &later).await?;
                            report.quarantined.push(later);
                        }
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }
            let (segment, outcome) =
                Segment::recover(Arc::clone(&storage), path.clone(), name, &config).await?;
            report.truncated_bytes = outcome.discarded_bytes;
            if outcome.valid_bytes > 0 {
                segments.push(segment);
            } else if outcome.discarded_bytes == 0 {
                segment.remove().await?;
                report.removed.push(path);
            } else {
                warn!(
                    %ntp,
                    segment = %segment.name(),
                    bytes = outcome.discarded_bytes,
                    "no valid batch in last segment, quarantining"
                );
                drop(segment);
                quarantine(storage.as_ref(), &path).await?;
                report.quarantined.push(path);
            }
        }

        let next_offset = segments
            .last()
            .map_or(start_offset, Segment::next_offset)
            .max(start_offset);
        info!(
            %ntp,
            segments = segments.len(),
            %start_offset,
            %next_offset,
            clean = report.is_clean(),
            "log opened"
        );

        Ok(Self {
            ntp,
            dir,
            storage,
            config,
            state: RwLock::new(LogState {
                segments,
                start_offset,
                next_offset,
                committed_offset: None,
                prefix_term: prefix.and_then(|p| p.term),
                generation: 0,
                closed: false,
            }),
            compaction_lock: Mutex::new(()),
            recovery: report,
        })
    }

    /// What recovery found when the log was opened.
    #[must_use]
    pub const fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// The partition this log stores.
    #[must_use]
    pub const fn ntp(&self) -> &Ntp {
        &self.ntp
    }

    /// Directory holding the segments.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The log's configuration.
    #[must_use]
    pub const fn config(&self) -> &LogConfig {
        &self.config
    }

    pub(crate) fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn ensure_open(&self, state: &LogState) -> StorageResult<()> {
        if state.closed {
            return Err(StorageError::Closed {
                ntp: self.ntp.to_string(),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Appends batches.
    ///
    /// In leader mode every batch is renumbered to continue the log and
    /// stamped with `config.term`. In follower mode each batch must start at
    /// or after the next expected offset. A batch starting later leaves a
    /// gap, which is how a compacted leader log replicates: the offsets of
    /// batches compaction removed are never sent.
    ///
    /// # Errors
    /// Returns [`StorageError::EmptyAppend`] for no batches,
    /// [`StorageError::OutOfOrderAppend`] for a follower batch that does not
    /// continue the log, or an I/O error.
    pub async fn append(
        &self,
        batches: Vec<RecordBatch>,
        config: AppendConfig,
    ) -> StorageResult<AppendResult> {
        if batches.is_empty() {
            return Err(StorageError::EmptyAppend);
        }
        let mut state = self.state.write().await;
        self.ensure_open(&state)?;

        if !config.assign_offsets {
            // Overlap is an error; gaps are compacted-away batches.
            let mut expected = state.next_offset;
            for batch in &batches {
                if batch.base_offset() < expected {
                    return Err(StorageError::OutOfOrderAppend {
                        expected,
                        actual: batch.base_offset(),
                    });
                }
                expected = batch.last_offset().next();
            }
        }

        let mut base_offset = None;
        let mut byte_size = 0u64;
        let mut last = (state.next_offset, config.term);
        for mut batch in batches {
            if config.assign_offsets {
                batch.assign(state.next_offset, config.term);
            }
            let segment = self
                .maybe_roll(&mut state, batch.base_offset(), batch.term())
                .await?;
            if let Err(e) = segment.append(&batch).await {
                // A failed write or sync keeps the batch in the segment
                // buffer; the log must agree on where it ends.
                let next = segment.next_offset();
                state.next_offset = state.next_offset.max(next);
                return Err(e);
            }
            state.next_offset = batch.last_offset().next();
            base_offset.get_or_insert(batch.base_offset());
            byte_size += u64::from(batch.size_bytes());
            last = (batch.last_offset(), batch.term());
        }

        Ok(AppendResult {
            base_offset: base_offset.unwrap_or(last.0),
            last_offset: last.0,
            last_term: last.1,
            byte_size,
        })
    }

    /// Returns the active segment, first starting a new one when the current
    /// one is missing, closed, full, or of another term.
    async fn maybe_roll<'a>(
        &self,
        state: &'a mut LogState,
        base_offset: Offset,
        term: TermId,
    ) -> StorageResult<&'a mut Segment> {
        let reusable = state.segments.last().is_some_and(|active| {
            !active.is_closed()
                && active.term() == term
                && active.size_bytes() < self.config.max_segment_bytes
        });
        if !reusable {
            if let Some(active) = state.segments.last_mut() {
                if active.is_empty() {
                    if let Some(empty) = state.segments.pop() {
                        empty.remove().await?;
                    }
                } else {
                    active.close().await?;
                }
            }
            let segment = Segment::create(
                Arc::clone(&self.storage),
                &self.dir,
                base_offset,
                term,
                &self.config,
            )
            .await?;
            debug!(ntp = %self.ntp, segment = %segment.name(), "rolled segment");
            state.segments.push(segment);
        }
        state
            .segments
            .last_mut()
            .ok_or_else(|| StorageError::io("append", "no active segment"))
    }

    /// Removes every offset `>= offset`.
    ///
    /// A no-op when `offset` is past the end. Live readers end their stream.
    ///
    /// # Errors
    /// Returns [`StorageError::TruncateMidBatch`] when `offset` is inside a
    /// batch, [`StorageError::OffsetOutOfRange`] when it is below the start.
    pub async fn truncate(&self, offset: Offset) -> StorageResult<()> {
        let mut state = self.state.write().await;
        self.ensure_open(&state)?;
        if offset >= state.next_offset {
            return Ok(());
        }
        if offset < state.start_offset {
            return Err(StorageError::OffsetOutOfRange {
                offset,
                start: state.start_offset,
                dirty: state.dirty_offset(),
            });
        }

        let keep = match state.segment_index(offset) {
            Some(i) if state.segments[i].base_offset() < offset => {
                // Validates before changing anything.
                state.segments[i].truncate(offset).await?;
                i + 1
            }
            Some(i) => i,
            None => 0,
        };
        while state.segments.len() > keep {
            if let Some(segment) = state.segments.pop() {
                segment.remove().await?;
            }
        }

        state.next_offset = offset;
        state.committed_offset = state.committed_offset.min(offset.prev());
        state.generation += 1;
        info!(ntp = %self.ntp, %offset, "log truncated");
        Ok(())
    }

    /// Drops every offset `< offset`, removing whole segments that fall below
    /// it. The new start is persisted.
    ///
    /// # Errors
    /// Returns an error if the prefix record cannot be written or a segment
    /// cannot be removed.
    pub async fn truncate_prefix(&self, offset: Offset) -> StorageResult<()> {
        let _compaction = self.compaction_lock.lock().await;
        let mut state = self.state.write().await;
        self.ensure_open(&state)?;
        if offset <= state.start_offset {
            return Ok(());
        }
        let term = offset.prev().and_then(|o| {
            let o = state.dirty_offset().map_or(o, |d| o.min(d));
            state.term_at(o)
        });
        self.set_start(&mut state, offset, term).await?;
        state.next_offset = state.next_offset.max(offset);
        state.committed_offset = state.committed_offset.max(offset.prev());
        info!(ntp = %self.ntp, %offset, "log prefix truncated");
        Ok(())
    }

    /// Discards all data and restarts the log at `start_offset`, treating
    /// everything before it as committed with `term` as its last term.
    ///
    /// # Errors
    /// Returns an error if segments cannot be removed or the prefix record
    /// cannot be written.
    pub async fn reset(&self, start_offset: Offset, term: Option<TermId>) -> StorageResult<()> {
        let _compaction = self.compaction_lock.lock().await;
        let mut state = self.state.write().await;
        self.ensure_open(&state)?;
        prefix::store(
            self.storage.as_ref(),
            &self.dir,
            PrefixMeta {
                start_offset,
                term,
            },
        )
        .await?;
        for segment in state.segments.drain(..) {
            segment.remove().await?;
        }
        state.start_offset = start_offset;
        state.next_offset = start_offset;
        state.committed_offset = start_offset.prev();
        state.prefix_term = term;
        state.generation += 1;
        info!(ntp = %self.ntp, %start_offset, "log reset");
        Ok(())
    }

    /// Persists a new start offset and removes segments entirely below it.
    pub(crate) async fn set_start(
        &self,
        state: &mut LogState,
        start_offset: Offset,
        term: Option<TermId>,
    ) -> StorageResult<()> {
        prefix::store(
            self.storage.as_ref(),
            &self.dir,
            PrefixMeta {
                start_offset,
                term,
            },
        )
        .await?;
        while state
            .segments
            .first()
            .is_some_and(|s| s.next_offset() <= start_offset)
        {
            let segment = state.segments.remove(0);
            segment.remove().await?;
        }
        state.start_offset = start_offset;
        state.prefix_term = term;
        Ok(())
    }

    /// Advances the committed offset. Never moves backwards and never past
    /// the dirty offset.
    pub async fn set_committed_offset(&self, offset: Offset) {
        let mut state = self.state.write().await;
        let Some(dirty) = state.dirty_offset() else {
            return;
        };
        let offset = Some(offset.min(dirty));
        if offset > state.committed_offset {
            state.committed_offset = offset;
        }
    }

    /// Writes buffered data and fsyncs the active segment.
    ///
    /// # Errors
    /// Returns an error if the write or sync fails.
    pub async fn flush(&self) -> StorageResult<()> {
        let mut state = self.state.write().await;
        if let Some(active) = state.segments.last_mut() {
            active.flush().await?;
        }
        Ok(())
    }

    /// Flushes and closes the log. Later operations fail with
    /// [`StorageError::Closed`].
    ///
    /// # Errors
    /// Returns an error if the final flush fails.
    pub async fn close(&self) -> StorageResult<()> {
        let mut state = self.state.write().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        if let Some(active) = state.segments.last_mut() {
            active.close().await?;
        }
        debug!(ntp = %self.ntp, "log closed");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Reads batches overlapping `[start_offset, max_offset]`.
    ///
    /// # Errors
    /// Returns [`StorageError::Corruption`] if a batch fails verification.
    pub async fn read(&self, config: ReaderConfig) -> StorageResult<Vec<RecordBatch>> {
        self.read_with_generation(config).await.map(|(b, _)| b)
    }

    /// Returns a stream reader starting at `config.start_offset`.
    pub async fn reader(self: &Arc<Self>, config: ReaderConfig) -> LogReader {
        let generation = self.state.read().await.generation;
        LogReader::new(Arc::clone(self), config, generation)
    }

    pub(crate) async fn read_with_generation(
        &self,
        config: ReaderConfig,
    ) -> StorageResult<(Vec<RecordBatch>, u64)> {
        let state = self.state.read().await;
        self.ensure_open(&state)?;
        let generation = state.generation;
        let start = config.start_offset.max(state.start_offset);
        let Some(dirty) = state.dirty_offset() else {
            return Ok((Vec::new(), generation));
        };
        let max_offset = config.max_offset.min(dirty);
        if start > max_offset {
            return Ok((Vec::new(), generation));
        }
        let bounded = ReaderConfig {
            start_offset: start,
            max_offset,
            ..config
        };

        let mut out = Vec::new();
        let mut gathered = 0usize;
        let first = state.segment_index(start).unwrap_or(0);
        for segment in &state.segments[first..] {
            if segment.base_offset() > max_offset {
                break;
            }
            if config.deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            let budget = config.max_bytes.saturating_sub(gathered).max(1);
            let batches = segment.read(&bounded, budget).await?;
            gathered += batches.iter().map(|b| b.size_bytes() as usize).sum::<usize>();
            out.extend(batches);
            if gathered >= config.max_bytes && !out.is_empty() {
                break;
            }
        }
        Ok((out, generation))
    }

    /// Returns the term of the batch holding `offset`.
    ///
    /// For `start_offset - 1` this is the term recorded at the last prefix
    /// truncation or reset.
    pub async fn term_at(&self, offset: Offset) -> Option<TermId> {
        self.state.read().await.term_at(offset)
    }

    /// Current offset bounds.
    pub async fn offsets(&self) -> LogOffsets {
        self.state.read().await.offsets()
    }

    /// Number of segments.
    pub async fn segment_count(&self) -> usize {
        self.state.read().await.segments.len()
    }

    /// Total bytes across segments.
    pub async fn size_bytes(&self) -> u64 {
        self.state
            .read()
            .await
            .segments
            .iter()
            .map(Segment::size_bytes)
            .sum()
    }

    /// Returns true once closed.
    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SimulatedStorage;
    use keel_core::{BatchType, IoBuf, RecordBatchBuilder};

    fn data_batch(records: usize) -> RecordBatch {
        let mut builder = RecordBatchBuilder::new(BatchType::RaftData);
        for i in 0..records {
            builder = builder.add_record(None, format!("record-{i}").as_str());
        }
        builder.build().unwrap()
    }

    fn numbered(base: u64, term: u64, records: usize) -> RecordBatch {
        let mut batch = data_batch(records);
        batch.assign(Offset::new(base), TermId::new(term));
        batch
    }

    fn small_config() -> LogConfig {
        LogConfig::new()
            .with_max_segment_bytes(1024)
            .with_index_interval_bytes(128)
    }

    async fn open(storage: &SimulatedStorage, config: LogConfig) -> Arc<Log> {
        let ntp = Ntp::new("kafka", "events", 0);
        let dir = PathBuf::from("/data").join(ntp.path());
        Arc::new(
            Log::open(ntp, dir, Arc::new(storage.clone()), config)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_leader_append_assigns_offsets() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, LogConfig::new()).await;
        let result = log
            .append(vec![data_batch(3), data_batch(2)], AppendConfig::assign(TermId::new(1)))
            .await
            .unwrap();
        assert_eq!(result.base_offset, Offset::ZERO);
        assert_eq!(result.last_offset, Offset::new(4));
        assert_eq!(result.last_term, TermId::new(1));

        let offsets = log.offsets().await;
        assert_eq!(offsets.dirty_offset, Some(Offset::new(4)));
        assert_eq!(offsets.last_term, Some(TermId::new(1)));

        let read = log.read(ReaderConfig::new(Offset::new(4))).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].base_offset(), Offset::new(3));
    }

    #[tokio::test]
    async fn test_empty_append_rejected() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, LogConfig::new()).await;
        let err = log
            .append(Vec::new(), AppendConfig::assign(TermId::new(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::EmptyAppend));
    }

    #[tokio::test]
    async fn test_follower_append_accepts_compaction_gap() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, LogConfig::new()).await;
        log.append(vec![numbered(0, 1, 2)], AppendConfig::preassigned())
            .await
            .unwrap();
        // Offsets 2..=4 were compacted away on the leader.
        let result = log
            .append(vec![numbered(5, 1, 1), numbered(8, 1, 2)], AppendConfig::preassigned())
            .await
            .unwrap();
        assert_eq!(result.base_offset, Offset::new(5));
        assert_eq!(result.last_offset, Offset::new(9));
        assert_eq!(log.offsets().await.dirty_offset, Some(Offset::new(9)));

        let bases: Vec<u64> = log
            .read(ReaderConfig::new(Offset::ZERO))
            .await
            .unwrap()
            .iter()
            .map(|b| b.base_offset().get())
            .collect();
        assert_eq!(bases, vec![0, 5, 8]);
        let from_gap = log.read(ReaderConfig::new(Offset::new(3))).await.unwrap();
        assert_eq!(from_gap[0].base_offset(), Offset::new(5));
        assert_eq!(log.term_at(Offset::new(3)).await, Some(TermId::new(1)));

        // Going back into the gap is still an overlap.
        let err = log
            .append(vec![numbered(6, 1, 1)], AppendConfig::preassigned())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::OutOfOrderAppend { expected, .. } if expected == Offset::new(10)
        ));
    }

    #[tokio::test]
    async fn test_failed_sync_on_append_keeps_offsets_consistent() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, LogConfig::new().with_sync_on_append(true)).await;
        storage.faults().force_fsync_fail = true;
        assert!(log
            .append(vec![numbered(0, 1, 2)], AppendConfig::preassigned())
            .await
            .is_err());
        assert_eq!(log.offsets().await.dirty_offset, Some(Offset::new(1)));

        log.flush().await.unwrap();
        let next = log
            .append(vec![numbered(2, 1, 1)], AppendConfig::preassigned())
            .await
            .unwrap();
        assert_eq!(next.last_offset, Offset::new(2));
    }

    #[tokio::test]
    async fn test_follower_append_rejects_overlap() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, LogConfig::new()).await;
        log.append(vec![numbered(0, 1, 5)], AppendConfig::preassigned())
            .await
            .unwrap();
        let err = log
            .append(vec![numbered(3, 1, 2)], AppendConfig::preassigned())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::OutOfOrderAppend { expected, .. } if expected == Offset::new(5)
        ));
    }

    #[tokio::test]
    async fn test_term_change_rolls_segment() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, LogConfig::new()).await;
        log.append(vec![numbered(0, 1, 2)], AppendConfig::preassigned())
            .await
            .unwrap();
        log.append(vec![numbered(2, 3, 2)], AppendConfig::preassigned())
            .await
            .unwrap();
        assert_eq!(log.segment_count().await, 2);
        assert_eq!(log.term_at(Offset::new(1)).await, Some(TermId::new(1)));
        assert_eq!(log.term_at(Offset::new(2)).await, Some(TermId::new(3)));
        assert_eq!(log.term_at(Offset::new(4)).await, None);
    }

    #[tokio::test]
    async fn test_size_rolls_and_reads_span_segments() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, small_config()).await;
        for _ in 0..20 {
            log.append(vec![data_batch(4)], AppendConfig::assign(TermId::new(1)))
                .await
                .unwrap();
        }
        assert!(log.segment_count().await > 1);

        let read = log
            .read(ReaderConfig::new(Offset::ZERO).with_max_bytes(usize::MAX))
            .await
            .unwrap();
        assert_eq!(read.len(), 20);
        for (i, batch) in read.iter().enumerate() {
            assert_eq!(batch.base_offset(), Offset::new(i as u64 * 4));
        }
    }

    #[tokio::test]
    async fn test_read_returns_one_batch_under_tiny_budget() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, LogConfig::new()).await;
        log.append(vec![data_batch(4), data_batch(4)], AppendConfig::assign(TermId::new(1)))
            .await
            .unwrap();
        let read = log
            .read(ReaderConfig::new(Offset::ZERO).with_max_bytes(1))
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_past_deadline_returns_nothing() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, LogConfig::new()).await;
        log.append(vec![data_batch(1)], AppendConfig::assign(TermId::new(1)))
            .await
            .unwrap();
        let deadline = Instant::now();
        tokio::time::advance(std::time::Duration::from_millis(1)).await;
        let read = log
            .read(ReaderConfig::new(Offset::ZERO).with_deadline(deadline))
            .await
            .unwrap();
        assert!(read.is_empty());
    }

    #[tokio::test]
    async fn test_type_filter() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, LogConfig::new()).await;
        let checkpoint = RecordBatchBuilder::new(BatchType::Checkpoint)
            .add_record(None, IoBuf::new())
            .build()
            .unwrap();
        log.append(
            vec![checkpoint, data_batch(2)],
            AppendConfig::assign(TermId::new(1)),
        )
        .await
        .unwrap();
        let read = log
            .read(ReaderConfig::new(Offset::ZERO).with_type_filter(BatchType::RaftData))
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].base_offset(), Offset::new(1));
    }

    #[tokio::test]
    async fn test_truncate_then_append_continues() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, small_config()).await;
        for _ in 0..10 {
            log.append(vec![data_batch(4)], AppendConfig::assign(TermId::new(1)))
                .await
                .unwrap();
        }
        log.set_committed_offset(Offset::new(30)).await;
        log.truncate(Offset::new(12)).await.unwrap();

        let offsets = log.offsets().await;
        assert_eq!(offsets.dirty_offset, Some(Offset::new(11)));
        assert_eq!(offsets.committed_offset, Some(Offset::new(11)));

        // Idempotent.
        log.truncate(Offset::new(12)).await.unwrap();
        assert_eq!(log.offsets().await.dirty_offset, Some(Offset::new(11)));

        let result = log
            .append(vec![data_batch(1)], AppendConfig::assign(TermId::new(2)))
            .await
            .unwrap();
        assert_eq!(result.base_offset, Offset::new(12));
    }

    #[tokio::test]
    async fn test_truncate_mid_batch_leaves_log_intact() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, LogConfig::new()).await;
        log.append(vec![data_batch(4), data_batch(4)], AppendConfig::assign(TermId::new(1)))
            .await
            .unwrap();
        let err = log.truncate(Offset::new(6)).await.unwrap_err();
        assert!(matches!(err, StorageError::TruncateMidBatch { .. }));
        assert_eq!(log.offsets().await.dirty_offset, Some(Offset::new(7)));
    }

    #[tokio::test]
    async fn test_reader_ends_on_truncation() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, LogConfig::new()).await;
        for _ in 0..4 {
            log.append(vec![data_batch(2)], AppendConfig::assign(TermId::new(1)))
                .await
                .unwrap();
        }
        let mut reader = log
            .reader(ReaderConfig::new(Offset::ZERO).with_max_bytes(1))
            .await;
        assert_eq!(reader.next_slice().await.unwrap().unwrap().len(), 1);
        assert_eq!(reader.next_offset(), Offset::new(2));

        log.truncate(Offset::new(4)).await.unwrap();
        assert!(reader.next_slice().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_streams_to_end() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, LogConfig::new()).await;
        for _ in 0..5 {
            log.append(vec![data_batch(2)], AppendConfig::assign(TermId::new(1)))
                .await
                .unwrap();
        }
        let mut reader = log
            .reader(
                ReaderConfig::new(Offset::ZERO)
                    .with_max_bytes(1)
                    .with_max_offset(Offset::new(7)),
            )
            .await;
        let mut seen = Vec::new();
        while let Some(slice) = reader.next_slice().await.unwrap() {
            seen.extend(slice.iter().map(|b| b.base_offset().get()));
        }
        assert_eq!(seen, vec![0, 2, 4, 6]);
    }

    #[tokio::test]
    async fn test_prefix_truncate_persists_start_and_term() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, small_config()).await;
        for term in 1..=4u64 {
            log.append(vec![data_batch(4)], AppendConfig::assign(TermId::new(term)))
                .await
                .unwrap();
        }
        assert_eq!(log.segment_count().await, 4);
        log.truncate_prefix(Offset::new(8)).await.unwrap();
        assert_eq!(log.segment_count().await, 2);
        assert_eq!(log.term_at(Offset::new(7)).await, Some(TermId::new(2)));

        // Reads below the start are clamped.
        let read = log.read(ReaderConfig::new(Offset::ZERO)).await.unwrap();
        assert_eq!(read[0].base_offset(), Offset::new(8));

        log.close().await.unwrap();
        let reopened = open(&storage, small_config()).await;
        let offsets = reopened.offsets().await;
        assert_eq!(offsets.start_offset, Offset::new(8));
        assert_eq!(offsets.dirty_offset, Some(Offset::new(15)));
        assert_eq!(reopened.term_at(Offset::new(7)).await, Some(TermId::new(2)));
    }

    #[tokio::test]
    async fn test_reset_restarts_log() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, LogConfig::new()).await;
        log.append(vec![data_batch(4)], AppendConfig::assign(TermId::new(1)))
            .await
            .unwrap();
        log.reset(Offset::new(100), Some(TermId::new(5))).await.unwrap();

        let offsets = log.offsets().await;
        assert_eq!(offsets.start_offset, Offset::new(100));
        assert_eq!(offsets.dirty_offset, Some(Offset::new(99)));
        assert_eq!(offsets.committed_offset, Some(Offset::new(99)));
        assert_eq!(offsets.last_term, Some(TermId::new(5)));
        assert_eq!(log.segment_count().await, 0);

        let result = log
            .append(vec![numbered(100, 5, 1)], AppendConfig::preassigned())
            .await
            .unwrap();
        assert_eq!(result.last_offset, Offset::new(100));
    }

    #[tokio::test]
    async fn test_committed_offset_is_monotonic_and_bounded() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, LogConfig::new()).await;
        log.set_committed_offset(Offset::new(3)).await;
        assert_eq!(log.offsets().await.committed_offset, None);

        log.append(vec![data_batch(4)], AppendConfig::assign(TermId::new(1)))
            .await
            .unwrap();
        log.set_committed_offset(Offset::new(10)).await;
        assert_eq!(log.offsets().await.committed_offset, Some(Offset::new(3)));
        log.set_committed_offset(Offset::new(1)).await;
        assert_eq!(log.offsets().await.committed_offset, Some(Offset::new(3)));
    }

    #[tokio::test]
    async fn test_reopen_recovers_torn_tail() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, LogConfig::new()).await;
        log.append(vec![data_batch(2), data_batch(2)], AppendConfig::assign(TermId::new(1)))
            .await
            .unwrap();
        log.flush().await.unwrap();
        let path = storage
            .paths()
            .into_iter()
            .find(|p| p.to_string_lossy().ends_with(".log"))
            .unwrap();
        let len = storage.raw_content(&path).unwrap().len();
        storage.truncate_file(&path, len - 1);

        let reopened = open(&storage, LogConfig::new()).await;
        assert_eq!(reopened.offsets().await.dirty_offset, Some(Offset::new(1)));
    }

    #[tokio::test]
    async fn test_reopen_quarantines_unreadable_segment() {
        let storage = SimulatedStorage::new();
        let dir = PathBuf::from("/data/kafka/events/0");
        let path = dir.join("0-1-v1.log");
        storage.set_raw_content(&path, vec![0xAB; 200]);

        let log = open(&storage, LogConfig::new()).await;
        assert_eq!(log.segment_count().await, 0);
        assert!(storage.raw_content(&path).is_none());
        assert!(storage
            .raw_content(&dir.join("0-1-v1.log.cannotrecover"))
            .is_some());
    }

    #[tokio::test]
    async fn test_reopen_removes_empty_segment_and_ignores_foreign_files() {
        let storage = SimulatedStorage::new();
        let dir = PathBuf::from("/data/kafka/events/0");
        storage.set_raw_content(&dir.join("0-1-v1.log"), Vec::new());
        storage.set_raw_content(&dir.join("0-1-v9.log"), vec![1, 2, 3]);
        storage.set_raw_content(&dir.join("notes.txt"), vec![1]);
        storage.set_raw_content(&dir.join("vote.state"), vec![1]);
        storage.set_raw_content(&dir.join("vote.state.tmp"), vec![1]);
        storage.set_raw_content(&dir.join("7-1-v1.log.cannotrecover"), vec![1]);

        let log = open(&storage, LogConfig::new()).await;
        assert_eq!(log.segment_count().await, 0);
        assert!(storage.raw_content(&dir.join("0-1-v1.log")).is_none());
        assert!(storage.raw_content(&dir.join("0-1-v9.log")).is_some());
        assert!(storage.raw_content(&dir.join("notes.txt")).is_some());

        let report = log.recovery();
        assert_eq!(report.ignored, vec![dir.join("0-1-v9.log"), dir.join("notes.txt")]);
        assert_eq!(report.removed, vec![dir.join("0-1-v1.log")]);
        assert!(report.quarantined.is_empty());
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_clean_reopen_reports_nothing() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, small_config()).await;
        for _ in 0..10 {
            log.append(vec![data_batch(3)], AppendConfig::assign(TermId::new(1)))
                .await
                .unwrap();
        }
        log.truncate_prefix(Offset::new(3)).await.unwrap();
        log.close().await.unwrap();

        let reopened = open(&storage, small_config()).await;
        assert!(reopened.recovery().is_clean(), "{:?}", reopened.recovery());
    }

    #[tokio::test]
    async fn test_reopen_quarantines_corrupt_closed_segment() {
        let storage = SimulatedStorage::new();
        let dir = PathBuf::from("/data/kafka/events/0");
        let log = open(&storage, LogConfig::new()).await;
        for term in 1..=3 {
            log.append(vec![data_batch(2)], AppendConfig::assign(TermId::new(term)))
                .await
                .unwrap();
        }
        log.close().await.unwrap();
        drop(log);
        // Segments 0-1, 2-2 and 4-3; damage the middle one's header.
        storage.corrupt_bytes(&dir.join("2-2-v1.log"), 0, 8);

        let reopened = open(&storage, LogConfig::new()).await;
        let offsets = reopened.offsets().await;
        assert_eq!(offsets.dirty_offset, Some(Offset::new(1)));
        assert_eq!(offsets.last_term, Some(TermId::new(1)));
        assert_eq!(reopened.segment_count().await, 1);
        assert_eq!(
            reopened.recovery().quarantined,
            vec![dir.join("2-2-v1.log"), dir.join("4-3-v1.log")]
        );
        for name in ["2-2-v1.log", "4-3-v1.log"] {
            assert!(storage.raw_content(&dir.join(name)).is_none());
            assert!(storage
                .raw_content(&dir.join(format!("{name}.cannotrecover")))
                .is_some());
        }

        // The log continues after the last intact segment.
        let appended = reopened
            .append(vec![data_batch(1)], AppendConfig::assign(TermId::new(4)))
            .await
            .unwrap();
        assert_eq!(appended.base_offset, Offset::new(2));
        reopened.close().await.unwrap();
        let again = open(&storage, LogConfig::new()).await;
        assert_eq!(again.offsets().await.dirty_offset, Some(Offset::new(2)));
        assert!(again.recovery().quarantined.is_empty());
    }

    #[tokio::test]
    async fn test_reopen_drops_corrupt_segment_below_start() {
        let storage = SimulatedStorage::new();
        let dir = PathBuf::from("/data/kafka/events/0");
        let log = open(&storage, LogConfig::new()).await;
        for term in 1..=3 {
            log.append(vec![data_batch(2)], AppendConfig::assign(TermId::new(term)))
                .await
                .unwrap();
        }
        log.truncate_prefix(Offset::new(2)).await.unwrap();
        log.close().await.unwrap();
        drop(log);
        // A crash mid prefix truncation can leave the old first segment.
        storage.set_raw_content(&dir.join("0-1-v1.log"), vec![0xAB; 100]);

        let reopened = open(&storage, LogConfig::new()).await;
        let offsets = reopened.offsets().await;
        assert_eq!(offsets.start_offset, Offset::new(2));
        assert_eq!(offsets.dirty_offset, Some(Offset::new(5)));
        assert_eq!(reopened.recovery().removed, vec![dir.join("0-1-v1.log")]);
        assert!(reopened.recovery().quarantined.is_empty());
    }

    #[tokio::test]
    async fn test_closed_log_rejects_operations() {
        let storage = SimulatedStorage::new();
        let log = open(&storage, LogConfig::new()).await;
        log.close().await.unwrap();
        let err = log
            .append(vec![data_batch(1)], AppendConfig::assign(TermId::new(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Closed { .. }));
        assert!(log.read(ReaderConfig::new(Offset::ZERO)).await.is_err());
    }
}
