//! Role, vote and replication bookkeeping of one consensus group.
//!
//! [`GroupState`] holds no handles and does no I/O. The group driver calls
//! into it under one lock and performs the persistence and network effects
//! its return values ask for.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use keel_core::{NodeId, Offset, TermId};
use tokio::time::Instant;

use crate::config::RaftConfig;
use crate::vote_store::VoteState;

/// Role of a node within one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Passive; accepts entries from the leader.
    #[default]
    Follower,
    /// Soliciting votes.
    Candidate,
    /// Accepts writes and replicates them.
    Leader,
}

/// Leader-side view of one follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowerProgress {
    /// Next offset to send.
    pub next_offset: Offset,
    /// Highest offset known replicated, if any.
    pub match_offset: Option<Offset>,
    /// A request to this follower is outstanding.
    pub in_flight: bool,
    /// Last reply received in the current term.
    pub last_ack: Instant,
}

impl FollowerProgress {
    const fn new(next_offset: Offset, now: Instant) -> Self {
        Self {
            next_offset,
            match_offset: None,
            in_flight: false,
            last_ack: now,
        }
    }
}

/// Volatile and persistent election state of one group.
#[derive(Debug)]
pub struct GroupState {
    node_id: NodeId,
    peers: Vec<NodeId>,
    quorum_size: usize,

    // Persistent; written through the vote store before it is acted on.
    term: TermId,
    voted_for: Option<NodeId>,

    role: Role,
    leader: Option<NodeId>,
    votes: HashSet<NodeId>,
    followers: HashMap<NodeId, FollowerProgress>,
    commit_index: Option<Offset>,
    last_contact: Instant,
}

impl GroupState {
    /// Creates a follower state from the persisted vote.
    #[must_use]
    pub fn new(config: &RaftConfig, vote: VoteState, commit_index: Option<Offset>) -> Self {
        Self {
            node_id: config.node_id,
            peers: config.peers(),
            quorum_size: config.quorum_size(),
            term: vote.term,
            voted_for: vote.voted_for,
            role: Role::Follower,
            leader: None,
            votes: HashSet::new(),
            followers: HashMap::new(),
            commit_index,
            last_contact: Instant::now(),
        }
    }

    /// Current term.
    #[must_use]
    pub const fn term(&self) -> TermId {
        self.term
    }

    /// Vote cast in the current term.
    #[must_use]
    pub const fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// The state to persist.
    #[must_use]
    pub const fn vote_state(&self) -> VoteState {
        VoteState {
            term: self.term,
            voted_for: self.voted_for,
        }
    }

    /// Current role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Returns true if this node leads the group.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader)
    }

    /// Known leader of the current term.
    #[must_use]
    pub const fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    /// Highest offset known committed.
    #[must_use]
    pub const fn commit_index(&self) -> Option<Offset> {
        self.commit_index
    }

    /// When the leader (or a granted candidate) was last heard from.
    #[must_use]
    pub const fn last_contact(&self) -> Instant {
        self.last_contact
    }

    /// Restarts the election timer.
    pub fn touch(&mut self, now: Instant) {
        self.last_contact = now;
    }

    /// Progress of `peer`, while leading.
    pub fn progress_mut(&mut self, peer: NodeId) -> Option<&mut FollowerProgress> {
        self.followers.get_mut(&peer)
    }

    /// Progress of `peer`, while leading.
    #[must_use]
    pub fn progress(&self, peer: NodeId) -> Option<FollowerProgress> {
        self.followers.get(&peer).copied()
    }

    // ------------------------------------------------------------------------
    // Terms and roles
    // ------------------------------------------------------------------------

    /// Adopts a higher term seen in a message, stepping down.
    ///
    /// Returns true if the term changed; the caller must persist the vote
    /// state before replying.
    pub fn observe_term(&mut self, term: TermId) -> bool {
        if term <= self.term {
            return false;
        }
        self.term = term;
        self.voted_for = None;
        self.role = Role::Follower;
        self.leader = None;
        self.votes.clear();
        self.followers.clear();
        true
    }

    /// Starts an election in the next term, voting for self.
    ///
    /// Returns true if this node alone forms a quorum.
    pub fn become_candidate(&mut self, now: Instant) -> bool {
        let prev_term = self.term;
        self.term = self.term.next();
        self.voted_for = Some(self.node_id);
        self.role = Role::Candidate;
        self.leader = None;
        self.followers.clear();
        self.votes.clear();
        self.votes.insert(self.node_id);
        self.last_contact = now;

        debug_assert_eq!(self.term.get(), prev_term.get() + 1);
        self.votes.len() >= self.quorum_size
    }

    /// Counts a granted vote from `from` for `term`.
    ///
    /// Returns true once the votes form a quorum.
    pub fn record_vote(&mut self, from: NodeId, term: TermId) -> bool {
        if self.role != Role::Candidate || term != self.term {
            return false;
        }
        if self.peers.contains(&from) {
            self.votes.insert(from);
        }
        self.votes.len() >= self.quorum_size
    }

    /// Takes leadership; every follower starts at `next_offset`.
    pub fn become_leader(&mut self, next_offset: Offset, now: Instant) {
        debug_assert_eq!(self.role, Role::Candidate);
        debug_assert!(self.votes.len() >= self.quorum_size);

        self.role = Role::Leader;
        self.leader = Some(self.node_id);
        self.votes.clear();
        self.followers = self
            .peers
            .iter()
            .map(|&peer| (peer, FollowerProgress::new(next_offset, now)))
            .collect();
    }

    /// Returns true if a quorum, self included, has answered within
    /// `window` of `now`.
    #[must_use]
    pub fn has_quorum_contact(&self, now: Instant, window: Duration) -> bool {
        let recent = self
            .followers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_ack) < window)
            .count();
        recent + 1 >= self.quorum_size
    }

    /// Follows `leader` in the current term.
    pub fn become_follower(&mut self, leader: Option<NodeId>, now: Instant) {
        self.role = Role::Follower;
        self.leader = leader;
        self.votes.clear();
        self.followers.clear();
        self.last_contact = now;
    }

    /// Decides a vote for `candidate` in the current term.
    ///
    /// The candidate's log must be at least as up to date as `own`: a
    /// higher last term wins, and equal last terms compare last offsets.
    /// Grants are recorded; the caller must persist before replying.
    pub fn grant_vote(
        &mut self,
        candidate: NodeId,
        candidate_last: (Option<TermId>, Option<Offset>),
        own_last: (Option<TermId>, Option<Offset>),
        now: Instant,
    ) -> bool {
        if self.voted_for.is_some_and(|v| v != candidate) {
            return false;
        }
        if candidate_last < own_last {
            return false;
        }
        self.voted_for = Some(candidate);
        self.last_contact = now;
        true
    }

    // ------------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------------

    /// Highest offset held by a quorum, counting this node at `own_match`.
    #[must_use]
    pub fn quorum_match(&self, own_match: Option<Offset>) -> Option<Offset> {
        let mut matches: Vec<Option<Offset>> = self
            .peers
            .iter()
            .map(|peer| self.followers.get(peer).and_then(|p| p.match_offset))
            .collect();
        matches.push(own_match);
        matches.sort_unstable_by(|a, b| b.cmp(a));
        matches.get(self.quorum_size - 1).copied().flatten()
    }

    /// Advances the leader's commit index to `candidate` if it was written in
    /// the current term.
    ///
    /// Entries of earlier terms commit only indirectly, once an entry of the
    /// current term above them commits.
    pub fn advance_leader_commit(
        &mut self,
        candidate: Offset,
        term_at_candidate: Option<TermId>,
    ) -> bool {
        if !self.is_leader() || term_at_candidate != Some(self.term) {
            return false;
        }
        self.raise_commit(candidate)
    }

    /// Raises the commit index as instructed by the leader.
    pub fn advance_follower_commit(&mut self, offset: Offset) -> bool {
        self.raise_commit(offset)
    }

    fn raise_commit(&mut self, offset: Offset) -> bool {
        if Some(offset) <= self.commit_index {
            return false;
        }
        let prev = self.commit_index;
        self.commit_index = Some(offset);
        debug_assert!(self.commit_index > prev);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::GroupId;

    fn config(node: u64, voters: u64) -> RaftConfig {
        RaftConfig::new(
            NodeId::new(node),
            GroupId::new(1),
            (1..=voters).map(NodeId::new).collect(),
        )
    }

    fn state(node: u64, voters: u64) -> GroupState {
        GroupState::new(&config(node, voters), VoteState::default(), None)
    }

    fn o(v: u64) -> Option<Offset> {
        Some(Offset::new(v))
    }

    fn t(v: u64) -> Option<TermId> {
        Some(TermId::new(v))
    }

    #[test]
    fn test_election_to_leader() {
        let mut s = state(1, 3);
        assert!(!s.become_candidate(Instant::now()));
        assert_eq!(s.term(), TermId::new(1));
        assert_eq!(s.voted_for(), Some(NodeId::new(1)));

        // Votes from the wrong term or from non-voters do not count.
        assert!(!s.record_vote(NodeId::new(2), TermId::new(0)));
        assert!(!s.record_vote(NodeId::new(9), TermId::new(1)));
        assert!(s.record_vote(NodeId::new(2), TermId::new(1)));

        s.become_leader(Offset::new(10), Instant::now());
        assert!(s.is_leader());
        assert_eq!(s.leader(), Some(NodeId::new(1)));
        assert_eq!(s.progress(NodeId::new(3)).unwrap().next_offset, Offset::new(10));
    }

    #[test]
    fn test_single_node_elects_itself() {
        let mut s = state(1, 1);
        assert!(s.become_candidate(Instant::now()));
    }

    #[test]
    fn test_higher_term_steps_down() {
        let mut s = state(1, 3);
        s.become_candidate(Instant::now());
        s.record_vote(NodeId::new(2), TermId::new(1));
        s.become_leader(Offset::ZERO, Instant::now());

        assert!(!s.observe_term(TermId::new(1)));
        assert!(s.observe_term(TermId::new(4)));
        assert_eq!(s.role(), Role::Follower);
        assert_eq!(s.voted_for(), None);
        assert_eq!(s.leader(), None);
        assert!(s.progress(NodeId::new(2)).is_none());
    }

    #[test]
    fn test_vote_once_per_term() {
        let mut s = state(1, 3);
        s.observe_term(TermId::new(2));
        let now = Instant::now();
        assert!(s.grant_vote(NodeId::new(2), (None, None), (None, None), now));
        assert!(!s.grant_vote(NodeId::new(3), (None, None), (None, None), now));
        // Repeated request from the same candidate is granted again.
        assert!(s.grant_vote(NodeId::new(2), (None, None), (None, None), now));
    }

    #[test]
    fn test_vote_requires_up_to_date_log() {
        let now = Instant::now();
        let own = (t(3), o(10));

        let mut s = state(1, 3);
        assert!(!s.grant_vote(NodeId::new(2), (t(2), o(50)), own, now));
        assert!(!s.grant_vote(NodeId::new(2), (t(3), o(9)), own, now));
        assert!(!s.grant_vote(NodeId::new(2), (None, None), own, now));
        assert!(s.grant_vote(NodeId::new(2), (t(3), o(10)), own, now));

        let mut s = state(1, 3);
        assert!(s.grant_vote(NodeId::new(3), (t(4), o(1)), own, now));
    }

    #[test]
    fn test_quorum_match() {
        let mut s = state(1, 5);
        s.become_candidate(Instant::now());
        s.record_vote(NodeId::new(2), TermId::new(1));
        s.record_vote(NodeId::new(3), TermId::new(1));
        s.become_leader(Offset::ZERO, Instant::now());

        assert_eq!(s.quorum_match(o(20)), None);
        s.progress_mut(NodeId::new(2)).unwrap().match_offset = o(15);
        assert_eq!(s.quorum_match(o(20)), None);
        s.progress_mut(NodeId::new(4)).unwrap().match_offset = o(8);
        assert_eq!(s.quorum_match(o(20)), o(8));
        s.progress_mut(NodeId::new(5)).unwrap().match_offset = o(30);
        assert_eq!(s.quorum_match(o(20)), o(20));
    }

    #[test]
    fn test_commit_only_counts_current_term() {
        let mut s = state(1, 3);
        s.observe_term(TermId::new(1));
        s.become_candidate(Instant::now());
        s.record_vote(NodeId::new(2), TermId::new(2));
        s.become_leader(Offset::new(5), Instant::now());

        assert!(!s.advance_leader_commit(Offset::new(4), t(1)));
        assert_eq!(s.commit_index(), None);
        assert!(s.advance_leader_commit(Offset::new(5), t(2)));
        assert_eq!(s.commit_index(), o(5));
        assert!(!s.advance_leader_commit(Offset::new(3), t(2)));
        assert_eq!(s.commit_index(), o(5));
    }

    #[test]
    fn test_quorum_contact_window() {
        let start = Instant::now();
        let mut s = state(1, 3);
        s.become_candidate(start);
        s.record_vote(NodeId::new(2), TermId::new(1));
        s.become_leader(Offset::ZERO, start);

        let window = Duration::from_millis(500);
        let later = start + Duration::from_millis(600);
        assert!(s.has_quorum_contact(start, window));
        assert!(!s.has_quorum_contact(later, window));
        s.progress_mut(NodeId::new(3)).unwrap().last_ack = later;
        assert!(s.has_quorum_contact(later, window));
    }

    #[test]
    fn test_follower_commit_monotonic() {
        let mut s = state(2, 3);
        assert!(s.advance_follower_commit(Offset::new(7)));
        assert!(!s.advance_follower_commit(Offset::new(6)));
        assert_eq!(s.commit_index(), o(7));
    }
}
