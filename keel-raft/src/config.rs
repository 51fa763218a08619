//! Consensus group configuration.

use std::time::Duration;

use keel_core::{GroupId, NodeId};

use crate::limits::{
    APPEND_BYTES_DEFAULT, ELECTION_TIMEOUT_US_DEFAULT_MAX, ELECTION_TIMEOUT_US_DEFAULT_MIN,
    ELECTION_TIMEOUT_US_MAX, ELECTION_TIMEOUT_US_MIN, GROUP_SIZE_MAX,
    HEARTBEAT_INTERVAL_US_DEFAULT, RPC_TIMEOUT_US_DEFAULT,
};

/// Configuration for one consensus group on one node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's ID.
    pub node_id: NodeId,

    /// The group replicated.
    pub group_id: GroupId,

    /// IDs of all voters (including this node).
    pub voters: Vec<NodeId>,

    /// Minimum election timeout in microseconds.
    pub election_timeout_min_us: u64,

    /// Maximum election timeout in microseconds.
    pub election_timeout_max_us: u64,

    /// Heartbeat interval in microseconds.
    pub heartbeat_interval_us: u64,

    /// Timeout of one outbound RPC in microseconds.
    pub rpc_timeout_us: u64,

    /// Byte budget of one append-entries request.
    pub max_append_bytes: usize,

    /// Seed for election jitter. `None` seeds from entropy.
    pub rng_seed: Option<u64>,
}

impl RaftConfig {
    /// Creates a configuration with default timing.
    #[must_use]
    pub fn new(node_id: NodeId, group_id: GroupId, voters: Vec<NodeId>) -> Self {
        Self {
            node_id,
            group_id,
            voters,
            election_timeout_min_us: ELECTION_TIMEOUT_US_DEFAULT_MIN,
            election_timeout_max_us: ELECTION_TIMEOUT_US_DEFAULT_MAX,
            heartbeat_interval_us: HEARTBEAT_INTERVAL_US_DEFAULT,
            rpc_timeout_us: RPC_TIMEOUT_US_DEFAULT,
            max_append_bytes: APPEND_BYTES_DEFAULT,
            rng_seed: None,
        }
    }

    /// Sets the election timeout range.
    #[must_use]
    pub const fn with_election_timeout(mut self, min_us: u64, max_us: u64) -> Self {
        self.election_timeout_min_us = min_us;
        self.election_timeout_max_us = max_us;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval_us: u64) -> Self {
        self.heartbeat_interval_us = interval_us;
        self
    }

    /// Sets the RPC timeout.
    #[must_use]
    pub const fn with_rpc_timeout(mut self, timeout_us: u64) -> Self {
        self.rpc_timeout_us = timeout_us;
        self
    }

    /// Sets the append-entries byte budget.
    #[must_use]
    pub const fn with_max_append_bytes(mut self, bytes: usize) -> Self {
        self.max_append_bytes = bytes;
        self
    }

    /// Seeds the election jitter.
    #[must_use]
    pub const fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Returns the number of voters.
    #[must_use]
    pub fn group_size(&self) -> usize {
        self.voters.len()
    }

    /// Returns the quorum size (strict majority).
    #[must_use]
    pub fn quorum_size(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    /// Returns the other voters.
    #[must_use]
    pub fn peers(&self) -> Vec<NodeId> {
        self.voters
            .iter()
            .copied()
            .filter(|&id| id != self.node_id)
            .collect()
    }

    /// Heartbeat interval as a duration.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_micros(self.heartbeat_interval_us)
    }

    /// RPC timeout as a duration.
    #[must_use]
    pub const fn rpc_timeout(&self) -> Duration {
        Duration::from_micros(self.rpc_timeout_us)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if the voter set or timing is invalid.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.voters.is_empty() {
            return Err("voters cannot be empty");
        }
        if self.voters.len() > GROUP_SIZE_MAX {
            return Err("too many voters");
        }
        if !self.voters.contains(&self.node_id) {
            return Err("node_id must be a voter");
        }
        let mut sorted = self.voters.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != self.voters.len() {
            return Err("duplicate voter");
        }
        if self.election_timeout_min_us > self.election_timeout_max_us {
            return Err("election timeout min exceeds max");
        }
        if self.election_timeout_min_us < ELECTION_TIMEOUT_US_MIN {
            return Err("election timeout below minimum");
        }
        if self.election_timeout_max_us > ELECTION_TIMEOUT_US_MAX {
            return Err("election timeout above maximum");
        }
        if self.heartbeat_interval_us == 0
            || self.heartbeat_interval_us >= self.election_timeout_min_us
        {
            return Err("heartbeat interval must be positive and below the election timeout");
        }
        if self.rpc_timeout_us == 0 {
            return Err("rpc timeout must be positive");
        }
        if self.max_append_bytes == 0 {
            return Err("max_append_bytes must be positive");
        }
        Ok(())
    }
}
