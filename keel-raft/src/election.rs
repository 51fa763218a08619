//! Leader election: candidacy and vote handling.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::consensus::Inner;
use crate::error::RaftResult;
use crate::message::{RaftReply, RaftRequest, VoteReply, VoteRequest};

/// Runs one election round in the next term.
///
/// The new term and self-vote are persisted before any request is sent.
/// Vote requests go out concurrently; the round ends at a quorum, at a
/// higher term in a reply, or once every peer answered or timed out.
pub(crate) async fn start_election(inner: &Arc<Inner>) -> RaftResult<()> {
    let request = {
        let mut state = inner.state.lock().await;
        inner.ensure_running()?;
        if state.is_leader() {
            return Ok(());
        }
        let won = state.become_candidate(Instant::now());
        inner.persist(&state).await?;
        inner.publish(&state);
        info!(
            group = %inner.group_id(),
            node = %inner.node_id(),
            term = %state.term(),
            "starting election"
        );
        if won {
            return inner.assume_leadership(&mut state).await;
        }

        let offsets = inner.log.offsets().await;
        VoteRequest {
            group: inner.group_id(),
            term: state.term(),
            candidate: inner.node_id(),
            last_offset: offsets.dirty_offset,
            last_term: offsets.last_term,
        }
    };

    let timeout = inner.config.rpc_timeout();
    let mut pending: FuturesUnordered<_> = inner
        .config
        .peers()
        .into_iter()
        .map(|peer| {
            let transport = Arc::clone(&inner.transport);
            async move {
                let result =
                    tokio::time::timeout(timeout, transport.send(peer, RaftRequest::Vote(request)))
                        .await;
                (peer, result)
            }
        })
        .collect();

    while let Some((peer, result)) = pending.next().await {
        let reply = match result {
            Ok(Ok(RaftReply::Vote(reply))) => reply,
            Ok(Ok(other)) => {
                debug!(group = %inner.group_id(), %peer, ?other, "unexpected reply to vote request");
                continue;
            }
            Ok(Err(err)) => {
                debug!(group = %inner.group_id(), %peer, error = %err, "vote request failed");
                continue;
            }
            Err(_) => {
                debug!(group = %inner.group_id(), %peer, "vote request timed out");
                continue;
            }
        };

        let mut state = inner.state.lock().await;
        if reply.term > state.term() {
            return inner.observe_term(&mut state, reply.term).await;
        }
        if !reply.granted {
            continue;
        }
        if state.record_vote(reply.node, request.term) {
            return inner.assume_leadership(&mut state).await;
        }
    }
    Ok(())
}

impl Inner {
    /// Answers a vote request. A grant is persisted before the reply.
    pub(crate) async fn handle_vote(&self, request: VoteRequest) -> RaftResult<VoteReply> {
        let mut state = self.state.lock().await;
        self.observe_term(&mut state, request.term).await?;

        let granted = if request.term < state.term() {
            false
        } else {
            let offsets = self.log.offsets().await;
            let granted = state.grant_vote(
                request.candidate,
                (request.last_term, request.last_offset),
                (offsets.last_term, offsets.dirty_offset),
                Instant::now(),
            );
            if granted {
                self.persist(&state).await?;
            }
            granted
        };

        debug!(
            group = %self.group_id(),
            candidate = %request.candidate,
            term = %request.term,
            granted,
            "vote requested"
        );
        Ok(VoteReply {
            group: self.group_id(),
            term: state.term(),
            node: self.node_id(),
            granted,
        })
    }
}
