//! Retention and key compaction.
//!
//! Retention deletes whole closed segments from the front of the log once
//! the log exceeds its byte bound or a segment's newest batch is older than
//! the time bound. Key compaction rewrites closed segments without batches
//! whose every record has a newer value for its key further on.
//!
//! Nothing above `max_collectible_offset` is touched, and the active
//! segment is never collected.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use keel_core::{BatchType, Offset, RecordBatch};
use tracing::{debug, info};

use crate::config::CompactionConfig;
use crate::error::{StorageError, StorageResult};
use crate::log::{Log, LogState, STAGING_SUFFIX};
use crate::segment::{index_path, Segment};

/// What one compaction pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Segments deleted by retention.
    pub segments_removed: usize,
    /// Segments rewritten by key compaction.
    pub segments_rewritten: usize,
    /// Batches dropped by key compaction.
    pub batches_removed: usize,
    /// Bytes released.
    pub bytes_reclaimed: u64,
}

/// A closed segment selected for rewriting.
struct Candidate {
    path: PathBuf,
    base_offset: Offset,
    size_bytes: u64,
    batches: Vec<RecordBatch>,
}

impl Log {
    /// Runs one cleanup pass according to `config`.
    ///
    /// # Errors
    /// Returns an error if reading, rewriting or removing a segment fails.
    pub async fn compact(&self, config: CompactionConfig) -> StorageResult<CompactionStats> {
        let _compaction = self.compaction_lock.lock().await;
        let mut stats = CompactionStats::default();
        let Some(max_collectible) = config.max_collectible_offset else {
            return Ok(stats);
        };
        if config.policy.deletes() {
            self.apply_retention(&config, max_collectible, &mut stats)
                .await?;
        }
        if config.policy.compacts() {
            self.compact_keys(max_collectible, &mut stats).await?;
        }
        if stats != CompactionStats::default() {
            info!(
                ntp = %self.ntp(),
                segments_removed = stats.segments_removed,
                segments_rewritten = stats.segments_rewritten,
                batches_removed = stats.batches_removed,
                bytes_reclaimed = stats.bytes_reclaimed,
                "compaction pass complete"
            );
        }
        Ok(stats)
    }

    async fn apply_retention(
        &self,
        config: &CompactionConfig,
        max_collectible: Offset,
        stats: &mut CompactionStats,
    ) -> StorageResult<()> {
        if config.retention_bytes.is_none() && config.retention.is_none() {
            return Ok(());
        }
        let mut state = self.state.write().await;
        let mut total: u64 = state.segments.iter().map(Segment::size_bytes).sum();
        let cutoff = config.retention.map(|r| {
            let millis = i64::try_from(r.as_millis()).unwrap_or(i64::MAX);
            config.now.as_millis().saturating_sub(millis)
        });

        let mut remove = 0usize;
        for (i, segment) in state.segments.iter().enumerate() {
            if !collectible(&state, i, max_collectible) {
                break;
            }
            let over_bytes = config.retention_bytes.is_some_and(|max| total > max);
            let expired = cutoff.is_some_and(|c| segment.max_timestamp().as_millis() < c);
            if !over_bytes && !expired {
                break;
            }
            total -= segment.size_bytes();
            remove = i + 1;
        }
        if remove == 0 {
            return Ok(());
        }

        let last_removed = &state.segments[remove - 1];
        let start = last_removed.next_offset().max(state.start_offset);
        let term = Some(last_removed.term());
        let before: u64 = state.segments[..remove].iter().map(Segment::size_bytes).sum();
        self.set_start(&mut state, start, term).await?;
        stats.segments_removed += remove;
        stats.bytes_reclaimed += before;
        state.committed_offset = state.committed_offset.max(start.prev());
        debug!(ntp = %self.ntp(), removed = remove, %start, "retention removed segments");
        Ok(())
    }

    async fn compact_keys(
        &self,
        max_collectible: Offset,
        stats: &mut CompactionStats,
    ) -> StorageResult<()> {
        let candidates = self.collect_candidates(max_collectible).await?;
        if candidates.is_empty() {
            return Ok(());
        }

        // Latest offset of every key in the collectible range.
        let mut latest: HashMap<Bytes, Offset> = HashMap::new();
        for candidate in &candidates {
            for batch in &candidate.batches {
                for (key, offset) in keyed_offsets(batch)? {
                    latest.insert(key, offset);
                }
            }
        }

        for candidate in candidates {
            let mut kept = BytesMut::new();
            let mut dropped = 0usize;
            for batch in &candidate.batches {
                if is_superseded(batch, &latest)? {
                    dropped += 1;
                } else {
                    batch.encode(&mut kept);
                }
            }
            if dropped == 0 {
                continue;
            }
            let new_size = kept.len() as u64;
            if self.swap_in(&candidate, kept.freeze()).await? {
                stats.segments_rewritten += 1;
                stats.batches_removed += dropped;
                stats.bytes_reclaimed += candidate.size_bytes - new_size;
            }
        }
        Ok(())
    }

    async fn collect_candidates(&self, max_collectible: Offset) -> StorageResult<Vec<Candidate>> {
        let state = self.state.read().await;
        let mut candidates = Vec::new();
        for (i, segment) in state.segments.iter().enumerate() {
            if !collectible(&state, i, max_collectible) {
                break;
            }
            let batches = segment.read_all().await?;
            candidates.push(Candidate {
                path: segment.path().to_path_buf(),
                base_offset: segment.base_offset(),
                size_bytes: segment.size_bytes(),
                batches: batches.into_iter().map(|(_, b)| b).collect(),
            });
        }
        Ok(candidates)
    }

    /// Writes `data` next to the candidate and renames it over the segment,
    /// unless the segment changed since it was read.
    async fn swap_in(&self, candidate: &Candidate, data: Bytes) -> StorageResult<bool> {
        let storage = Arc::clone(self.storage());
        let mut staging = candidate.path.as_os_str().to_owned();
        staging.push(STAGING_SUFFIX);
        let staging = PathBuf::from(staging);

        let file = storage.open(&staging).await?;
        file.truncate(0).await?;
        file.write_at(0, &data).await?;
        file.sync().await?;
        drop(file);

        let mut state = self.state.write().await;
        let position = state.segments.iter().position(|s| {
            s.base_offset() == candidate.base_offset
                && s.size_bytes() == candidate.size_bytes
                && s.is_closed()
        });
        let Some(i) = position.filter(|&i| i + 1 < state.segments.len()) else {
            debug!(ntp = %self.ntp(), path = ?candidate.path, "segment changed during compaction, discarding");
            storage.remove(&staging).await?;
            return Ok(false);
        };

        let name = state.segments[i].name().clone();
        let index = index_path(&candidate.path);
        if storage.exists(&index).await? {
            storage.remove(&index).await?;
        }
        storage.rename(&staging, &candidate.path).await?;
        let rewritten =
            Segment::open(storage, candidate.path.clone(), name, self.config()).await?;
        state.segments[i] = rewritten;
        Ok(true)
    }
}

/// A segment is collectible if it is closed, not the active segment, and
/// entirely at or below `max_collectible`.
fn collectible(state: &LogState, i: usize, max_collectible: Offset) -> bool {
    let segment = &state.segments[i];
    i + 1 < state.segments.len()
        && segment.is_closed()
        && segment.dirty_offset().map_or(true, |d| d <= max_collectible)
}

/// Keys and absolute offsets of an uncompressed data batch's records.
fn keyed_offsets(batch: &RecordBatch) -> StorageResult<Vec<(Bytes, Offset)>> {
    if batch.is_compressed() || batch.header().batch_type != BatchType::RaftData {
        return Ok(Vec::new());
    }
    let mut batch = batch.copy();
    let base = batch.base_offset();
    let records = batch.records().map_err(|source| StorageError::Corruption {
        segment: format!("batch at {base}"),
        position: 0,
        source,
    })?;
    Ok(records
        .into_iter()
        .filter_map(|r| {
            r.key
                .map(|k| (k.to_bytes(), base.add(u64::from(r.offset_delta))))
        })
        .collect())
}

/// A batch can go only when it is an uncompressed data batch and every one
/// of its records is keyed and has a newer value elsewhere.
fn is_superseded(batch: &RecordBatch, latest: &HashMap<Bytes, Offset>) -> StorageResult<bool> {
    if batch.is_compressed() || batch.header().batch_type != BatchType::RaftData {
        return Ok(false);
    }
    let keyed = keyed_offsets(batch)?;
    if keyed.len() != batch.record_count() as usize {
        return Ok(false);
    }
    Ok(keyed
        .iter()
        .all(|(key, offset)| latest.get(key).is_some_and(|l| l > offset)))
}
