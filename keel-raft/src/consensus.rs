//! One Raft replica of one partition log.
//!
//! A [`ConsensusGroup`] owns a driver task that runs the election timer
//! and, while leading, the heartbeat tick. Each tick (and each local
//! append) wakes one short-lived dispatch task per follower. Inbound RPCs
//! are handled by whoever calls [`ConsensusGroup::handle`], usually a
//! [`crate::GroupManager`].
//!
//! All role and vote bookkeeping happens under one async mutex around
//! [`GroupState`]. The mutex is held across disk writes (vote persistence,
//! follower appends) but never across an outbound RPC.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use keel_core::{BatchType, GroupId, IoBuf, NodeId, Offset, RecordBatch, RecordBatchBuilder, TermId};
use keel_storage::{AppendConfig, Log, ReaderConfig, Storage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RaftConfig;
use crate::election;
use crate::error::{RaftError, RaftResult};
use crate::message::{RaftReply, RaftRequest};
use crate::replication;
use crate::state::{GroupState, Role};
use crate::transport::Transport;
use crate::vote_store::VoteStore;

/// When [`ConsensusGroup::replicate`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyLevel {
    /// After a quorum has persisted the batches and the commit index covers
    /// them.
    QuorumAck,
    /// After the leader has persisted the batches. They are not committed
    /// yet and are lost if the leader fails before replicating them.
    LeaderAck,
}

/// Where replicated batches landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicateResult {
    /// First offset assigned.
    pub base_offset: Offset,
    /// Last offset assigned.
    pub last_offset: Offset,
    /// Term the batches were written in.
    pub term: TermId,
}

/// Observable state of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupStatus {
    /// Current term.
    pub term: TermId,
    /// Current role.
    pub role: Role,
    /// Known leader.
    pub leader: Option<NodeId>,
    /// Highest committed offset.
    pub commit_index: Option<Offset>,
}

impl GroupStatus {
    const fn of(state: &GroupState) -> Self {
        Self {
            term: state.term(),
            role: state.role(),
            leader: state.leader(),
            commit_index: state.commit_index(),
        }
    }
}

// ----------------------------------------------------------------------------
// Shared state
// ----------------------------------------------------------------------------

pub(crate) struct Inner {
    pub(crate) config: RaftConfig,
    pub(crate) log: Arc<Log>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) vote_store: VoteStore,
    pub(crate) state: Mutex<GroupState>,
    status: watch::Sender<GroupStatus>,
    shutdown: watch::Sender<bool>,
    rng: StdMutex<StdRng>,
}

impl Inner {
    pub(crate) const fn group_id(&self) -> GroupId {
        self.config.group_id
    }

    pub(crate) const fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub(crate) fn ensure_running(&self) -> RaftResult<()> {
        if *self.shutdown.borrow() {
            return Err(RaftError::Shutdown {
                group: self.group_id(),
            });
        }
        Ok(())
    }

    /// Publishes the observable part of `state` if it changed.
    pub(crate) fn publish(&self, state: &GroupState) {
        let status = GroupStatus::of(state);
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    pub(crate) async fn persist(&self, state: &GroupState) -> RaftResult<()> {
        self.vote_store.save(state.vote_state()).await?;
        Ok(())
    }

    /// Adopts a higher term, persisting it before anything is acted on.
    pub(crate) async fn observe_term(&self, state: &mut GroupState, term: TermId) -> RaftResult<()> {
        let was_leader = state.is_leader();
        if state.observe_term(term) {
            self.persist(state).await?;
            if was_leader {
                info!(group = %self.group_id(), %term, "stepping down for higher term");
            }
            self.publish(state);
        }
        Ok(())
    }

    fn election_timeout(&self) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let us = rng.gen_range(self.config.election_timeout_min_us..=self.config.election_timeout_max_us);
        Duration::from_micros(us)
    }

    /// Wakes a dispatch task for every follower.
    pub(crate) fn dispatch_all(self: &Arc<Self>) {
        for peer in self.config.peers() {
            tokio::spawn(replication::replicate_to(Arc::clone(self), peer));
        }
    }

    // ------------------------------------------------------------------------
    // Leadership
    // ------------------------------------------------------------------------

    /// Turns a winning candidate into the leader and writes the term's
    /// checkpoint batch.
    pub(crate) async fn assume_leadership(self: &Arc<Self>, state: &mut GroupState) -> RaftResult<()> {
        let offsets = self.log.offsets().await;
        let now = Instant::now();
        state.become_leader(Offset::after(offsets.dirty_offset), now);
        info!(
            group = %self.group_id(),
            node = %self.node_id(),
            term = %state.term(),
            dirty = ?offsets.dirty_offset,
            "became leader"
        );

        let checkpoint = RecordBatchBuilder::new(BatchType::Checkpoint)
            .add_record(None, IoBuf::new())
            .build()?;
        if let Err(err) = self.append_local(state, vec![checkpoint]).await {
            warn!(group = %self.group_id(), error = %err, "checkpoint append failed, stepping down");
            state.become_follower(None, now);
            self.publish(state);
            return Err(err);
        }
        self.publish(state);
        self.dispatch_all();
        Ok(())
    }

    /// Appends and flushes in the leader's term, then recomputes the commit
    /// index (a single-node group commits here).
    pub(crate) async fn append_local(
        &self,
        state: &mut GroupState,
        batches: Vec<RecordBatch>,
    ) -> RaftResult<ReplicateResult> {
        debug_assert!(state.is_leader());
        let term = state.term();
        let appended = self.log.append(batches, AppendConfig::assign(term)).await?;
        self.log.flush().await?;
        self.advance_leader_commit(state).await;
        Ok(ReplicateResult {
            base_offset: appended.base_offset,
            last_offset: appended.last_offset,
            term,
        })
    }

    /// Commits the highest offset persisted by a quorum, if it belongs to
    /// the current term.
    pub(crate) async fn advance_leader_commit(&self, state: &mut GroupState) {
        let own = self.log.offsets().await.dirty_offset;
        let Some(candidate) = state.quorum_match(own) else {
            return;
        };
        let term = self.log.term_at(candidate).await;
        if state.advance_leader_commit(candidate, term) {
            self.log.set_committed_offset(candidate).await;
            debug!(group = %self.group_id(), commit = %candidate, "commit index advanced");
            self.publish(state);
        }
    }

    /// Raises a follower's commit index.
    pub(crate) async fn advance_follower_commit(&self, state: &mut GroupState, offset: Offset) {
        if state.advance_follower_commit(offset) {
            self.log.set_committed_offset(offset).await;
            self.publish(state);
        }
    }

    async fn leader_tick(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if !state.is_leader() {
                return;
            }
            let window = Duration::from_micros(self.config.election_timeout_max_us);
            let now = Instant::now();
            if !state.has_quorum_contact(now, window) {
                warn!(group = %self.group_id(), term = %state.term(), "lost contact with quorum, stepping down");
                state.become_follower(None, now);
                self.publish(&state);
                return;
            }
        }
        self.dispatch_all();
    }

    async fn wait_for_commit(&self, result: ReplicateResult, status: &mut watch::Receiver<GroupStatus>) -> RaftResult<()> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let current = *status.borrow_and_update();
            if current.term == result.term && current.commit_index >= Some(result.last_offset) {
                return Ok(());
            }
            if current.term != result.term || current.role != Role::Leader {
                return Err(RaftError::LeadershipLost {
                    group: self.group_id(),
                    term: result.term,
                });
            }
            self.ensure_running()?;
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        return Err(RaftError::Shutdown { group: self.group_id() });
                    }
                }
                _ = shutdown.changed() => {
                    return Err(RaftError::Shutdown { group: self.group_id() });
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Driver
// ----------------------------------------------------------------------------

async fn run(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let (role, last_contact) = {
            let state = inner.state.lock().await;
            (state.role(), state.last_contact())
        };
        let timeout = inner.election_timeout();
        let deadline = match role {
            Role::Leader => Instant::now() + inner.config.heartbeat_interval(),
            Role::Follower | Role::Candidate => last_contact + timeout,
        };
        tokio::select! {
            _ = shutdown.changed() => break,
            () = tokio::time::sleep_until(deadline) => {}
        }

        if role == Role::Leader {
            inner.leader_tick().await;
            continue;
        }
        let due = {
            let state = inner.state.lock().await;
            !state.is_leader() && state.last_contact() + timeout <= Instant::now()
        };
        if due {
            if let Err(err) = election::start_election(&inner).await {
                warn!(group = %inner.group_id(), error = %err, "election failed");
            }
        }
    }
    debug!(group = %inner.group_id(), node = %inner.node_id(), "driver stopped");
}

// ----------------------------------------------------------------------------
// Public handle
// ----------------------------------------------------------------------------

/// A running consensus group. Clones share the same replica.
#[derive(Clone)]
pub struct ConsensusGroup {
    inner: Arc<Inner>,
    driver: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for ConsensusGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusGroup")
            .field("group", &self.inner.group_id())
            .field("node", &self.inner.node_id())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ConsensusGroup {
    /// Starts a replica over `log`.
    ///
    /// The persisted vote is loaded before the driver starts, so the replica
    /// never votes twice in a term across restarts. The vote file lives in
    /// the log's directory on `storage`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the vote state
    /// cannot be read.
    pub async fn start(
        config: RaftConfig,
        log: Arc<Log>,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
    ) -> RaftResult<Self> {
        config
            .validate()
            .map_err(|reason| RaftError::InvalidConfig { reason })?;

        let vote_store = VoteStore::new(storage, log.dir());
        let vote = vote_store.load().await?;
        let offsets = log.offsets().await;
        // Everything before the log start was committed when it was cut.
        let commit_index = offsets.committed_offset.max(offsets.start_offset.prev());
        if let Some(commit) = commit_index {
            log.set_committed_offset(commit).await;
        }
        let state = GroupState::new(&config, vote, commit_index);

        let rng = config
            .rng_seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let (status, _) = watch::channel(GroupStatus::of(&state));
        let (shutdown, _) = watch::channel(false);

        info!(
            group = %config.group_id,
            node = %config.node_id,
            term = %vote.term,
            voted_for = ?vote.voted_for,
            dirty = ?offsets.dirty_offset,
            "consensus group started"
        );

        let inner = Arc::new(Inner {
            config,
            log,
            transport,
            vote_store,
            state: Mutex::new(state),
            status,
            shutdown,
            rng: StdMutex::new(rng),
        });
        let driver = tokio::spawn(run(Arc::clone(&inner)));
        Ok(Self {
            inner,
            driver: Arc::new(StdMutex::new(Some(driver))),
        })
    }

    /// The group replicated.
    #[must_use]
    pub fn group_id(&self) -> GroupId {
        self.inner.group_id()
    }

    /// This replica's node.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.inner.node_id()
    }

    /// The replicated log.
    #[must_use]
    pub fn log(&self) -> &Arc<Log> {
        &self.inner.log
    }

    /// Latest observable state.
    #[must_use]
    pub fn status(&self) -> GroupStatus {
        *self.inner.status.borrow()
    }

    /// Watches the observable state.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<GroupStatus> {
        self.inner.status.subscribe()
    }

    /// Current role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.status().role
    }

    /// Returns true if this replica leads the group.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// Current term.
    #[must_use]
    pub fn term(&self) -> TermId {
        self.status().term
    }

    /// Known leader.
    #[must_use]
    pub fn leader(&self) -> Option<NodeId> {
        self.status().leader
    }

    /// Highest committed offset.
    #[must_use]
    pub fn commit_index(&self) -> Option<Offset> {
        self.status().commit_index
    }

    /// Appends `batches` in the current term and replicates them.
    ///
    /// No timeout is applied. A caller that gives up waiting must treat the
    /// outcome as unknown: the batches may already be durable and may
    /// still commit.
    ///
    /// # Errors
    /// Returns [`RaftError::NotLeader`] on a non-leader,
    /// [`RaftError::LeadershipLost`] if leadership changed before a
    /// quorum-ack write committed, or a storage error.
    pub async fn replicate(
        &self,
        batches: Vec<RecordBatch>,
        level: ConsistencyLevel,
    ) -> RaftResult<ReplicateResult> {
        let mut status = self.inner.status.subscribe();
        let result = {
            let mut state = self.inner.state.lock().await;
            self.inner.ensure_running()?;
            if !state.is_leader() {
                return Err(RaftError::NotLeader {
                    group: self.group_id(),
                    leader_hint: state.leader(),
                });
            }
            self.inner.append_local(&mut state, batches).await?
        };
        self.inner.dispatch_all();

        debug!(
            group = %self.group_id(),
            base = %result.base_offset,
            last = %result.last_offset,
            term = %result.term,
            ?level,
            "replicating"
        );
        if level == ConsistencyLevel::QuorumAck {
            self.inner.wait_for_commit(result, &mut status).await?;
        }
        Ok(result)
    }

    /// Reads committed batches.
    ///
    /// `config.max_offset` is lowered to the commit index.
    ///
    /// # Errors
    /// Returns [`RaftError::OffsetNotCommitted`] if `config.start_offset` is
    /// beyond the commit index.
    pub async fn read(&self, config: ReaderConfig) -> RaftResult<Vec<RecordBatch>> {
        self.inner.ensure_running()?;
        let committed = self.inner.state.lock().await.commit_index();
        let Some(commit) = committed.filter(|&c| config.start_offset <= c) else {
            return Err(RaftError::OffsetNotCommitted {
                offset: config.start_offset,
                committed,
            });
        };
        let bounded = config.with_max_offset(config.max_offset.min(commit));
        Ok(self.inner.log.read(bounded).await?)
    }

    /// Gives up leadership without changing the term.
    pub async fn step_down(&self) {
        let mut state = self.inner.state.lock().await;
        if state.is_leader() {
            info!(group = %self.group_id(), term = %state.term(), "stepping down");
            state.become_follower(None, Instant::now());
            self.inner.publish(&state);
        }
    }

    /// Handles an inbound request.
    ///
    /// # Errors
    /// Returns an error if the group is shut down or the local log fails.
    pub async fn handle(&self, request: RaftRequest) -> RaftResult<RaftReply> {
        self.inner.ensure_running()?;
        Ok(match request {
            RaftRequest::Vote(r) => RaftReply::Vote(self.inner.handle_vote(r).await?),
            RaftRequest::AppendEntries(r) => {
                RaftReply::AppendEntries(self.inner.handle_append_entries(r).await?)
            }
            RaftRequest::InstallSnapshot(r) => {
                RaftReply::InstallSnapshot(self.inner.handle_install_snapshot(r).await?)
            }
        })
    }

    /// Stops the driver and rejects further requests. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            driver.abort();
        }
        let mut state = self.inner.state.lock().await;
        state.become_follower(None, Instant::now());
        self.inner.publish(&state);
        info!(group = %self.group_id(), node = %self.node_id(), "consensus group shut down");
    }

    /// Returns true once [`ConsensusGroup::shutdown`] has run.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.ensure_running().is_err()
    }
}
