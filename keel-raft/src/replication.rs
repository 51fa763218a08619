//! Log replication: leader dispatch and follower handling.
//!
//! The leader keeps at most one request outstanding per follower. A
//! dispatch task claims the follower, builds a request under the state lock
//! from the follower's `next_offset`, releases the lock for the RPC, then
//! applies the reply. It keeps sending while the follower is behind and
//! releases the claim when it catches up or the peer fails; the next
//! heartbeat tick retries.

use std::sync::Arc;

use keel_core::{NodeId, Offset, RecordBatch, TermId};
use keel_storage::{AppendConfig, LogOffsets, ReaderConfig};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::consensus::Inner;
use crate::error::RaftResult;
use crate::message::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest,
    RaftReply, RaftRequest,
};
use crate::state::GroupState;

// ----------------------------------------------------------------------------
// Leader side
// ----------------------------------------------------------------------------

/// Brings `peer` up to date with the leader's log.
pub(crate) async fn replicate_to(inner: Arc<Inner>, peer: NodeId) {
    let Some(term) = inner.claim_peer(peer).await else {
        return;
    };
    loop {
        let request = match inner.build_request(peer, term).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(err) => {
                warn!(group = %inner.group_id(), %peer, error = %err, "could not build request");
                inner.release_peer(peer, term).await;
                return;
            }
        };

        let sent = tokio::time::timeout(inner.config.rpc_timeout(), inner.transport.send(peer, request)).await;
        let reply = match sent {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                debug!(group = %inner.group_id(), %peer, error = %err, "replication request failed");
                inner.release_peer(peer, term).await;
                return;
            }
            Err(_) => {
                debug!(group = %inner.group_id(), %peer, "replication request timed out");
                inner.release_peer(peer, term).await;
                return;
            }
        };

        match inner.apply_reply(peer, term, reply).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                warn!(group = %inner.group_id(), %peer, error = %err, "could not apply reply");
                inner.release_peer(peer, term).await;
                return;
            }
        }
    }
}

impl Inner {
    /// Marks a request to `peer` outstanding. Returns the leader's term, or
    /// `None` when not leading or a request is already outstanding.
    async fn claim_peer(&self, peer: NodeId) -> Option<TermId> {
        if self.ensure_running().is_err() {
            return None;
        }
        let mut state = self.state.lock().await;
        if !state.is_leader() {
            return None;
        }
        let term = state.term();
        let progress = state.progress_mut(peer)?;
        if progress.in_flight {
            return None;
        }
        progress.in_flight = true;
        Some(term)
    }

    async fn release_peer(&self, peer: NodeId, term: TermId) {
        let mut state = self.state.lock().await;
        if state.term() != term {
            return;
        }
        if let Some(progress) = state.progress_mut(peer) {
            progress.in_flight = false;
        }
    }

    /// Builds the next request for `peer`. Returns `None`, with the claim
    /// released, when there is nothing to send.
    async fn build_request(&self, peer: NodeId, term: TermId) -> RaftResult<Option<RaftRequest>> {
        let mut state = self.state.lock().await;
        if !state.is_leader() || state.term() != term || self.ensure_running().is_err() {
            return Ok(None);
        }
        let Some(progress) = state.progress(peer) else {
            return Ok(None);
        };
        let offsets = self.log.offsets().await;
        let next = progress
            .next_offset
            .min(Offset::after(offsets.dirty_offset));

        // The follower needs offsets this log no longer has.
        if next < offsets.start_offset {
            return Ok(self.snapshot_request(&mut state, peer, &offsets).await);
        }

        let batches = if Some(next) <= offsets.dirty_offset {
            let config = ReaderConfig::new(next).with_max_bytes(self.config.max_append_bytes);
            self.log.read(config).await?
        } else {
            Vec::new()
        };
        if let Some(first) = batches.first() {
            // A batch cut by a prefix truncation cannot be sent whole, so the
            // snapshot covers it.
            if first.base_offset() < offsets.start_offset {
                let last = first.last_offset();
                let last_term = first.term();
                return Ok(self.snapshot_at(&mut state, peer, last, Some(last_term)));
            }
        }

        let from = batches.first().map_or(next, |b| b.base_offset().min(next));
        let prev_offset = from.prev();
        let prev_term = match prev_offset {
            Some(prev) => self.log.term_at(prev).await,
            None => None,
        };
        if prev_offset.is_some() && prev_term.is_none() {
            warn!(group = %self.group_id(), %peer, prev = ?prev_offset, "no term for previous offset");
            release(&mut state, peer);
            return Ok(None);
        }
        Ok(Some(RaftRequest::AppendEntries(AppendEntriesRequest {
            group: self.group_id(),
            term,
            leader: self.node_id(),
            prev_offset,
            prev_term,
            leader_commit: state.commit_index(),
            batches,
        })))
    }

    async fn snapshot_request(
        &self,
        state: &mut GroupState,
        peer: NodeId,
        offsets: &LogOffsets,
    ) -> Option<RaftRequest> {
        let last = offsets.start_offset.prev()?;
        let last_term = self.log.term_at(last).await;
        self.snapshot_at(state, peer, last, last_term)
    }

    fn snapshot_at(
        &self,
        state: &mut GroupState,
        peer: NodeId,
        last: Offset,
        last_term: Option<TermId>,
    ) -> Option<RaftRequest> {
        let Some(last_term) = last_term else {
            warn!(group = %self.group_id(), %peer, %last, "no term for snapshot boundary");
            release(state, peer);
            return None;
        };
        info!(group = %self.group_id(), %peer, %last, "sending snapshot");
        Some(RaftRequest::InstallSnapshot(InstallSnapshotRequest {
            group: self.group_id(),
            term: state.term(),
            leader: self.node_id(),
            last_included_offset: last,
            last_included_term: last_term,
        }))
    }

    /// Applies a follower's reply. Returns true if another request should
    /// follow immediately; otherwise the claim has been released.
    async fn apply_reply(&self, peer: NodeId, term: TermId, reply: RaftReply) -> RaftResult<bool> {
        let mut state = self.state.lock().await;
        if reply.term() > state.term() {
            self.observe_term(&mut state, reply.term()).await?;
            return Ok(false);
        }
        if !state.is_leader() || state.term() != term {
            return Ok(false);
        }
        let dirty = self.log.offsets().await.dirty_offset;
        let Some(progress) = state.progress_mut(peer) else {
            return Ok(false);
        };
        progress.last_ack = Instant::now();

        let more = match reply {
            RaftReply::AppendEntries(r) if r.success => {
                progress.match_offset = progress.match_offset.max(r.match_offset);
                progress.next_offset = Offset::after(progress.match_offset);
                Some(progress.next_offset) <= dirty
            }
            RaftReply::AppendEntries(r) => {
                let before = progress.next_offset;
                let backed = before.prev().unwrap_or(Offset::ZERO);
                let hinted = Offset::after(r.last_offset);
                progress.next_offset = hinted
                    .min(backed)
                    .max(Offset::after(progress.match_offset));
                debug!(
                    group = %self.group_id(),
                    %peer,
                    from = %before,
                    to = %progress.next_offset,
                    "follower rejected entries, backing up"
                );
                progress.next_offset != before
            }
            RaftReply::InstallSnapshot(r) if r.success => {
                progress.match_offset = progress.match_offset.max(Some(r.match_offset));
                progress.next_offset = Offset::after(progress.match_offset);
                true
            }
            RaftReply::InstallSnapshot(_) => false,
            RaftReply::Vote(_) => {
                warn!(group = %self.group_id(), %peer, "vote reply to a replication request");
                false
            }
        };
        if !more {
            progress.in_flight = false;
        }
        self.advance_leader_commit(&mut state).await;
        Ok(more)
    }
}

fn release(state: &mut GroupState, peer: NodeId) {
    if let Some(progress) = state.progress_mut(peer) {
        progress.in_flight = false;
    }
}

// ----------------------------------------------------------------------------
// Follower side
// ----------------------------------------------------------------------------

impl Inner {
    /// Steps into the follower role for the sender of a current-term message.
    async fn follow(&self, state: &mut GroupState, term: TermId, leader: NodeId) -> RaftResult<()> {
        self.observe_term(state, term).await?;
        debug_assert!(!state.is_leader(), "two leaders in {term}");
        if state.leader() != Some(leader) {
            info!(group = %self.group_id(), %leader, %term, "following leader");
        }
        state.become_follower(Some(leader), Instant::now());
        self.publish(state);
        Ok(())
    }

    /// Answers an append-entries request.
    ///
    /// Batches already present with the same term are skipped, the first
    /// conflicting suffix is cut, and the rest is appended. The log is synced
    /// before any success reply, so the acknowledged offset is durable even
    /// when it was matched rather than written by this request.
    pub(crate) async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesReply> {
        let mut state = self.state.lock().await;
        if request.term < state.term() {
            let dirty = self.log.offsets().await.dirty_offset;
            return Ok(self.append_reply(&state, false, None, dirty));
        }
        self.follow(&mut state, request.term, request.leader).await?;

        let offsets = self.log.offsets().await;
        if !self.prev_matches(&offsets, request.prev_offset, request.prev_term).await {
            debug!(
                group = %self.group_id(),
                prev = ?request.prev_offset,
                prev_term = ?request.prev_term,
                dirty = ?offsets.dirty_offset,
                "previous entry does not match"
            );
            return Ok(self.append_reply(&state, false, None, offsets.dirty_offset));
        }

        let mut last_matched = request.prev_offset;
        let mut pending = Vec::new();
        for batch in request.batches {
            if pending.is_empty() && self.batch_present(&offsets, &batch).await {
                last_matched = Some(batch.last_offset());
                continue;
            }
            pending.push(batch);
        }

        if let Some(first) = pending.first() {
            let base = first.base_offset();
            if Some(base) <= offsets.dirty_offset {
                debug_assert!(
                    state.commit_index() < Some(base),
                    "truncating committed offset {base}"
                );
                info!(group = %self.group_id(), from = %base, "truncating conflicting suffix");
                self.log.truncate(base).await?;
            }
            let appended = self.log.append(pending, AppendConfig::preassigned()).await?;
            last_matched = Some(appended.last_offset);
        }
        if last_matched.is_some() {
            // Skipped batches may still sit in a buffer an earlier failed
            // flush left behind. A no-op when everything is on disk.
            self.log.flush().await?;
        }

        if let (Some(leader_commit), Some(matched)) = (request.leader_commit, last_matched) {
            self.advance_follower_commit(&mut state, leader_commit.min(matched)).await;
        }
        let dirty = self.log.offsets().await.dirty_offset;
        Ok(self.append_reply(&state, true, last_matched, dirty))
    }

    async fn prev_matches(
        &self,
        offsets: &LogOffsets,
        prev_offset: Option<Offset>,
        prev_term: Option<TermId>,
    ) -> bool {
        let Some(prev) = prev_offset else {
            return true;
        };
        if Some(prev) > offsets.dirty_offset {
            return false;
        }
        // Below our start everything is committed and therefore matches.
        if Some(prev) < offsets.start_offset.prev() {
            return true;
        }
        self.log.term_at(prev).await == prev_term
    }

    /// Returns true if `batch` is already in the log in the same term.
    async fn batch_present(&self, offsets: &LogOffsets, batch: &RecordBatch) -> bool {
        let (base, last) = (batch.base_offset(), batch.last_offset());
        if last < offsets.start_offset {
            return true;
        }
        if Some(last) > offsets.dirty_offset {
            return false;
        }
        let term = Some(batch.term());
        self.log.term_at(last).await == term
            && (base < offsets.start_offset || self.log.term_at(base).await == term)
    }

    fn append_reply(
        &self,
        state: &GroupState,
        success: bool,
        match_offset: Option<Offset>,
        last_offset: Option<Offset>,
    ) -> AppendEntriesReply {
        AppendEntriesReply {
            group: self.group_id(),
            term: state.term(),
            node: self.node_id(),
            success,
            match_offset,
            last_offset,
        }
    }

    /// Answers an install-snapshot request by restarting the log after the
    /// snapshot boundary. A suffix that agrees with the boundary is kept.
    pub(crate) async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotReply> {
        let mut state = self.state.lock().await;
        let last = request.last_included_offset;
        if request.term < state.term() {
            return Ok(InstallSnapshotReply {
                group: self.group_id(),
                term: state.term(),
                node: self.node_id(),
                success: false,
                match_offset: last,
            });
        }
        self.follow(&mut state, request.term, request.leader).await?;

        let offsets = self.log.offsets().await;
        if Some(last) <= offsets.start_offset.prev() {
            debug!(group = %self.group_id(), %last, "snapshot already covered");
        } else if self.log.term_at(last).await == Some(request.last_included_term) {
            self.log.truncate_prefix(last.next()).await?;
        } else {
            self.log.reset(last.next(), Some(request.last_included_term)).await?;
        }
        info!(
            group = %self.group_id(),
            %last,
            term = %request.last_included_term,
            "installed snapshot"
        );
        self.advance_follower_commit(&mut state, last).await;

        Ok(InstallSnapshotReply {
            group: self.group_id(),
            term: state.term(),
            node: self.node_id(),
            success: true,
            match_offset: last,
        })
    }
}
