//! A group of nodes replicating one partition over a [`SimulatedNetwork`].
//!
//! Each node owns a [`SimulatedStorage`] that survives crashes. Crashing a
//! node shuts its consensus group down and drops its logs without closing
//! them; restarting reopens the logs from the same storage, so recovery
//! runs exactly as after a process crash.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use keel_core::{BatchType, GroupId, NodeId, Ntp, RecordBatch, RecordBatchBuilder};
use keel_raft::{
    ConsensusGroup, ConsistencyLevel, GroupManager, RaftConfig, RaftError, RaftResult,
    ReplicateResult, Role,
};
use keel_storage::{LogConfig, LogManager, LogManagerConfig, LogOffsets, ReaderConfig, SimulatedStorage};
use tokio::time::{sleep, Instant};
use tracing::info;

use crate::network::SimulatedNetwork;
use crate::properties::{CommitHistory, PropertyViolation};

/// How often waits re-check the cluster.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Cluster shape and timing.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of nodes, numbered from 1.
    pub size: u64,
    /// The replicated group.
    pub group_id: GroupId,
    /// Seed for every node's election jitter.
    pub seed: u64,
    /// Configuration of each node's log.
    pub log_config: LogConfig,
    /// Election timeout bounds in microseconds.
    pub election_timeout_us: (u64, u64),
    /// Heartbeat interval in microseconds.
    pub heartbeat_interval_us: u64,
}

impl ClusterConfig {
    /// Creates a configuration for `size` nodes with fast timing.
    #[must_use]
    pub const fn new(size: u64) -> Self {
        Self {
            size,
            group_id: GroupId::new(1),
            seed: 0,
            log_config: LogConfig::new(),
            election_timeout_us: (150_000, 300_000),
            heartbeat_interval_us: 30_000,
        }
    }

    /// Sets the jitter seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the log configuration.
    #[must_use]
    pub const fn with_log_config(mut self, config: LogConfig) -> Self {
        self.log_config = config;
        self
    }
}

/// The partition every cluster replicates.
#[must_use]
pub fn ntp() -> Ntp {
    Ntp::new("kafka", "events", 0)
}

fn node_root(id: NodeId) -> PathBuf {
    PathBuf::from(format!("/{id}"))
}

/// Builds a data batch with one record per value.
///
/// # Panics
/// Panics if the batch exceeds the batch size limits.
#[must_use]
pub fn data_batch(values: &[&str]) -> RecordBatch {
    values
        .iter()
        .fold(RecordBatchBuilder::new(BatchType::RaftData), |b, v| {
            b.add_record(None, *v)
        })
        .build()
        .expect("test batch within limits")
}

/// Record values of the data batches, in offset order.
///
/// # Panics
/// Panics if a batch body cannot be parsed.
#[must_use]
pub fn data_values(batches: Vec<RecordBatch>) -> Vec<String> {
    batches
        .into_iter()
        .filter(|b| b.header().batch_type == BatchType::RaftData)
        .flat_map(|mut b| b.records().expect("readable batch body"))
        .map(|r| String::from_utf8_lossy(&r.value.to_bytes()).into_owned())
        .collect()
}

#[derive(Debug)]
struct Running {
    logs: LogManager,
    manager: Arc<GroupManager>,
    group: ConsensusGroup,
}

#[derive(Debug)]
struct Node {
    storage: SimulatedStorage,
    running: Option<Running>,
}

/// Nodes, their storage and the network between them.
#[derive(Debug)]
pub struct Cluster {
    config: ClusterConfig,
    network: SimulatedNetwork,
    nodes: BTreeMap<NodeId, Node>,
}

impl Cluster {
    /// Starts every node.
    ///
    /// # Errors
    /// Returns an error if a node fails to start.
    pub async fn start(config: ClusterConfig) -> RaftResult<Self> {
        let mut cluster = Self {
            config,
            network: SimulatedNetwork::new(),
            nodes: BTreeMap::new(),
        };
        for id in cluster.voters() {
            cluster.nodes.insert(
                id,
                Node {
                    storage: SimulatedStorage::new(),
                    running: None,
                },
            );
            cluster.restart(id).await?;
        }
        Ok(cluster)
    }

    fn voters(&self) -> Vec<NodeId> {
        (1..=self.config.size).map(NodeId::new).collect()
    }

    async fn boot(&self, id: NodeId, storage: &SimulatedStorage) -> RaftResult<Running> {
        let logs = LogManager::new(
            LogManagerConfig::new(node_root(id))
                .with_default_log_config(self.config.log_config.clone()),
            Arc::new(storage.clone()),
        )?;
        let log = logs.manage(ntp()).await?;
        let (min, max) = self.config.election_timeout_us;
        let raft = RaftConfig::new(id, self.config.group_id, self.voters())
            .with_election_timeout(min, max)
            .with_heartbeat_interval(self.config.heartbeat_interval_us)
            .with_rng_seed(self.config.seed ^ id.get());
        let group = ConsensusGroup::start(
            raft,
            log,
            self.network.transport(id),
            Arc::new(storage.clone()),
        )
        .await?;
        let manager = Arc::new(GroupManager::new(id));
        manager.add(group.clone()).await?;
        Ok(Running {
            logs,
            manager,
            group,
        })
    }

    /// Node IDs, sorted.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// The network between the nodes.
    #[must_use]
    pub const fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    /// A node's storage.
    #[must_use]
    pub fn storage(&self, id: NodeId) -> Option<&SimulatedStorage> {
        self.nodes.get(&id).map(|n| &n.storage)
    }

    /// Directory of a node's log for [`ntp`].
    #[must_use]
    pub fn log_dir(id: NodeId) -> PathBuf {
        node_root(id).join(ntp().path())
    }

    /// A running node's consensus group.
    #[must_use]
    pub fn group(&self, id: NodeId) -> Option<&ConsensusGroup> {
        self.nodes.get(&id)?.running.as_ref().map(|r| &r.group)
    }

    /// Returns true if the node is up.
    #[must_use]
    pub fn is_running(&self, id: NodeId) -> bool {
        self.group(id).is_some()
    }

    fn running(&self) -> impl Iterator<Item = &ConsensusGroup> {
        self.nodes
            .values()
            .filter_map(|n| n.running.as_ref().map(|r| &r.group))
    }

    /// Kills a node without closing its logs.
    pub async fn crash(&mut self, id: NodeId) {
        let Some(running) = self.nodes.get_mut(&id).and_then(|n| n.running.take()) else {
            return;
        };
        self.network.detach(id);
        running.manager.shutdown_all().await;
        drop(running.logs);
        info!(node = %id, "node crashed");
    }

    /// Starts a stopped node from its surviving storage.
    ///
    /// # Errors
    /// Returns an error if recovery or startup fails.
    pub async fn restart(&mut self, id: NodeId) -> RaftResult<()> {
        let Some(storage) = self.nodes.get(&id).map(|n| n.storage.clone()) else {
            return Ok(());
        };
        if self.is_running(id) {
            return Ok(());
        }
        let running = self.boot(id, &storage).await?;
        self.network.attach(id, Arc::clone(&running.manager));
        if let Some(node) = self.nodes.get_mut(&id) {
            node.running = Some(running);
        }
        info!(node = %id, "node started");
        Ok(())
    }

    /// Shuts every node down cleanly.
    ///
    /// # Errors
    /// Returns the first log close failure.
    pub async fn stop(&mut self) -> RaftResult<()> {
        for (&id, node) in &mut self.nodes {
            if let Some(running) = node.running.take() {
                self.network.detach(id);
                running.manager.shutdown_all().await;
                running.logs.stop().await?;
            }
        }
        Ok(())
    }

    /// The current leader: the running leader of the highest term.
    #[must_use]
    pub fn leader(&self) -> Option<NodeId> {
        self.running()
            .filter(|g| g.is_leader())
            .max_by_key(|g| g.term())
            .map(ConsensusGroup::node_id)
    }

    /// Waits until the current leader is one of `candidates`.
    pub async fn wait_for_leader_among(
        &self,
        candidates: &[NodeId],
        within: Duration,
    ) -> Option<NodeId> {
        let deadline = Instant::now() + within;
        loop {
            if let Some(leader) = self.leader().filter(|id| candidates.contains(id)) {
                return Some(leader);
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Waits for any node to lead.
    pub async fn wait_for_leader(&self, within: Duration) -> Option<NodeId> {
        self.wait_for_leader_among(&self.node_ids(), within).await
    }

    /// Replicates one batch through `leader`.
    ///
    /// # Errors
    /// Returns an error if the node is down or rejects the write.
    pub async fn replicate(
        &self,
        leader: NodeId,
        values: &[&str],
        level: ConsistencyLevel,
    ) -> RaftResult<ReplicateResult> {
        let group = self.group(leader).ok_or(RaftError::Shutdown {
            group: self.config.group_id,
        })?;
        group.replicate(vec![data_batch(values)], level).await
    }

    /// Log offsets of a running node.
    pub async fn offsets(&self, id: NodeId) -> Option<LogOffsets> {
        Some(self.group(id)?.log().offsets().await)
    }

    /// Batches the node's log holds as committed.
    ///
    /// # Errors
    /// Returns an error if the log cannot be read.
    pub async fn committed_batches(&self, id: NodeId) -> RaftResult<Vec<RecordBatch>> {
        let Some(group) = self.group(id) else {
            return Ok(Vec::new());
        };
        let offsets = group.log().offsets().await;
        let Some(committed) = offsets.committed_offset else {
            return Ok(Vec::new());
        };
        if committed < offsets.start_offset {
            return Ok(Vec::new());
        }
        let config = ReaderConfig::new(offsets.start_offset).with_max_offset(committed);
        Ok(group.log().read(config).await?)
    }

    /// Waits until every running node holds the same log, fully committed.
    pub async fn wait_for_convergence(&self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            let mut seen = Vec::new();
            for group in self.running() {
                let offsets = group.log().offsets().await;
                seen.push((offsets.dirty_offset, offsets.committed_offset));
            }
            let converged = seen
                .first()
                .is_some_and(|&(dirty, committed)| dirty == committed)
                && seen.windows(2).all(|w| w[0] == w[1]);
            if converged {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Feeds every running node's state into `history`.
    ///
    /// # Errors
    /// Returns the first safety violation found.
    ///
    /// # Panics
    /// Panics if a committed range cannot be read.
    pub async fn check(&self, history: &mut CommitHistory) -> Result<(), PropertyViolation> {
        for group in self.running() {
            let status = group.status();
            if status.role == Role::Leader {
                history.observe_leader(status.term, group.node_id())?;
            }
            history.observe_commit_index(group.node_id(), status.commit_index)?;
            let batches = self
                .committed_batches(group.node_id())
                .await
                .expect("committed range readable");
            history.observe_committed(group.node_id(), &batches)?;
        }
        Ok(())
    }
}
