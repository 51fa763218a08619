//! Keel Raft - per-partition consensus groups.
//!
//! Each partition is replicated by one [`ConsensusGroup`] running over that
//! partition's [`keel_storage::Log`]. The log is the Raft log: batch offsets
//! are Raft indices and every batch carries the term that wrote it.
//!
//! # Design Principles
//!
//! - **Correctness first**: commit only counts entries of the leader's own
//!   term; votes are persisted before they are sent
//! - **Pure core**: role, vote and progress bookkeeping live in
//!   [`GroupState`], which does no I/O
//! - **No lock across the network**: the state lock is never held while an
//!   RPC is outstanding
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod codec;
mod config;
mod consensus;
mod election;
mod error;
mod group_manager;
mod message;
mod replication;
mod state;
mod transport;
mod vote_store;

pub use codec::{decode_reply, decode_request, encode_reply, encode_request, ApiKey};
pub use config::RaftConfig;
pub use consensus::{ConsensusGroup, ConsistencyLevel, GroupStatus, ReplicateResult};
pub use error::{CodecError, RaftError, RaftResult, TransportError, VoteStoreError};
pub use group_manager::GroupManager;
pub use message::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest,
    RaftReply, RaftRequest, VoteReply, VoteRequest,
};
pub use state::{FollowerProgress, GroupState, Role};
pub use transport::Transport;
pub use vote_store::{VoteState, VoteStore, VOTE_FILE_NAME};

/// Raft configuration limits.
pub mod limits {
    /// Minimum election timeout (microseconds).
    pub const ELECTION_TIMEOUT_US_MIN: u64 = 10_000; // 10ms

    /// Maximum election timeout (microseconds).
    pub const ELECTION_TIMEOUT_US_MAX: u64 = 10_000_000; // 10s

    /// Default lower bound of the randomized election timeout (microseconds).
    pub const ELECTION_TIMEOUT_US_DEFAULT_MIN: u64 = 300_000; // 300ms

    /// Default upper bound of the randomized election timeout (microseconds).
    pub const ELECTION_TIMEOUT_US_DEFAULT_MAX: u64 = 600_000; // 600ms

    /// Default heartbeat interval (microseconds).
    pub const HEARTBEAT_INTERVAL_US_DEFAULT: u64 = 50_000; // 50ms

    /// Default timeout of one outbound RPC (microseconds).
    pub const RPC_TIMEOUT_US_DEFAULT: u64 = 200_000; // 200ms

    /// Default byte budget of one append-entries request (1 MB).
    pub const APPEND_BYTES_DEFAULT: usize = 1024 * 1024;

    /// Maximum number of voters in a group.
    pub const GROUP_SIZE_MAX: usize = 7;

    /// Maximum number of batches decoded from one append-entries request.
    pub const APPEND_BATCH_COUNT_MAX: u32 = 10_000;
}
