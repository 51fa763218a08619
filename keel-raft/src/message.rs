//! Consensus RPC messages.
//!
//! Offsets and terms that may not exist (an empty log) are `Option`s;
//! `None` sorts below every `Some`, matching "before the first entry".

use keel_core::{GroupId, NodeId, Offset, RecordBatch, TermId};

/// Request from a candidate for a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteRequest {
    /// Target group.
    pub group: GroupId,
    /// Candidate's term.
    pub term: TermId,
    /// Candidate requesting the vote.
    pub candidate: NodeId,
    /// Candidate's last offset.
    pub last_offset: Option<Offset>,
    /// Term of the candidate's last offset.
    pub last_term: Option<TermId>,
}

/// Answer to a [`VoteRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteReply {
    /// Target group.
    pub group: GroupId,
    /// Voter's term after handling the request.
    pub term: TermId,
    /// The voter.
    pub node: NodeId,
    /// Whether the vote was granted.
    pub granted: bool,
}

/// Log replication request from the leader; empty `batches` is a heartbeat.
#[derive(Debug)]
pub struct AppendEntriesRequest {
    /// Target group.
    pub group: GroupId,
    /// Leader's term.
    pub term: TermId,
    /// The leader.
    pub leader: NodeId,
    /// Offset just before the first batch.
    pub prev_offset: Option<Offset>,
    /// Term at `prev_offset`.
    pub prev_term: Option<TermId>,
    /// Leader's commit index.
    pub leader_commit: Option<Offset>,
    /// Batches to append, in offset order.
    pub batches: Vec<RecordBatch>,
}

/// Answer to an [`AppendEntriesRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendEntriesReply {
    /// Target group.
    pub group: GroupId,
    /// Follower's term after handling the request.
    pub term: TermId,
    /// The follower.
    pub node: NodeId,
    /// Whether the entries were accepted.
    pub success: bool,
    /// On success, the last offset now known to match the leader and be
    /// durable on the follower.
    pub match_offset: Option<Offset>,
    /// Follower's dirty offset, used by the leader to back up on a reject.
    pub last_offset: Option<Offset>,
}

/// Tells a lagging follower to restart its log after `last_included_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallSnapshotRequest {
    /// Target group.
    pub group: GroupId,
    /// Leader's term.
    pub term: TermId,
    /// The leader.
    pub leader: NodeId,
    /// Last offset covered by the snapshot.
    pub last_included_offset: Offset,
    /// Term at `last_included_offset`.
    pub last_included_term: TermId,
}

/// Answer to an [`InstallSnapshotRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallSnapshotReply {
    /// Target group.
    pub group: GroupId,
    /// Follower's term after handling the request.
    pub term: TermId,
    /// The follower.
    pub node: NodeId,
    /// Whether the follower's log now starts after the snapshot.
    pub success: bool,
    /// Last offset the follower now holds in agreement with the leader.
    pub match_offset: Offset,
}

/// Any request between consensus groups.
#[derive(Debug)]
pub enum RaftRequest {
    /// Vote solicitation.
    Vote(VoteRequest),
    /// Replication or heartbeat.
    AppendEntries(AppendEntriesRequest),
    /// Log restart for a lagging follower.
    InstallSnapshot(InstallSnapshotRequest),
}

impl RaftRequest {
    /// The group addressed.
    #[must_use]
    pub const fn group(&self) -> GroupId {
        match self {
            Self::Vote(r) => r.group,
            Self::AppendEntries(r) => r.group,
            Self::InstallSnapshot(r) => r.group,
        }
    }

    /// The sender's term.
    #[must_use]
    pub const fn term(&self) -> TermId {
        match self {
            Self::Vote(r) => r.term,
            Self::AppendEntries(r) => r.term,
            Self::InstallSnapshot(r) => r.term,
        }
    }
}

/// Any reply between consensus groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftReply {
    /// Vote answer.
    Vote(VoteReply),
    /// Replication answer.
    AppendEntries(AppendEntriesReply),
    /// Snapshot answer.
    InstallSnapshot(InstallSnapshotReply),
}

impl RaftReply {
    /// The group answering.
    #[must_use]
    pub const fn group(&self) -> GroupId {
        match self {
            Self::Vote(r) => r.group,
            Self::AppendEntries(r) => r.group,
            Self::InstallSnapshot(r) => r.group,
        }
    }

    /// The replier's term.
    #[must_use]
    pub const fn term(&self) -> TermId {
        match self {
            Self::Vote(r) => r.term,
            Self::AppendEntries(r) => r.term,
            Self::InstallSnapshot(r) => r.term,
        }
    }
}
