//! Consensus, transport, codec and vote-store errors.

use keel_core::{CoreError, GroupId, NodeId, Offset, TermId};
use keel_storage::StorageError;
use thiserror::Error;

/// Result type for consensus operations.
pub type RaftResult<T> = Result<T, RaftError>;

/// Errors returned by consensus groups.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The operation requires the leader.
    #[error("{group} is not led by this node (leader hint: {leader_hint:?})")]
    NotLeader {
        /// The group.
        group: GroupId,
        /// Current leader, if known.
        leader_hint: Option<NodeId>,
    },

    /// Leadership was lost before the entries were known committed. They
    /// may or may not commit.
    #[error("{group} lost leadership in {term} before commit")]
    LeadershipLost {
        /// The group.
        group: GroupId,
        /// Term in which the entries were appended.
        term: TermId,
    },

    /// A read started beyond the commit index.
    #[error("offset {offset} is not committed (commit index {committed:?})")]
    OffsetNotCommitted {
        /// Requested offset.
        offset: Offset,
        /// Current commit index.
        committed: Option<Offset>,
    },

    /// No group with this ID is registered.
    #[error("unknown group {group}")]
    UnknownGroup {
        /// The group.
        group: GroupId,
    },

    /// The group has been shut down.
    #[error("{group} is shut down")]
    Shutdown {
        /// The group.
        group: GroupId,
    },

    /// Configuration rejected by `validate()`.
    #[error("invalid raft configuration: {reason}")]
    InvalidConfig {
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Local log failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Vote state could not be read or written.
    #[error(transparent)]
    VoteStore(#[from] VoteStoreError),

    /// A message could not be delivered.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A message could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A batch could not be built.
    #[error(transparent)]
    Batch(#[from] CoreError),
}

impl RaftError {
    /// Returns true if retrying the operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::NotLeader { .. } | Self::LeadershipLost { .. } => true,
            Self::Storage(e) => e.is_retryable(),
            Self::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Errors delivering a message to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer cannot be reached.
    #[error("{node} is unreachable")]
    Unreachable {
        /// The peer.
        node: NodeId,
    },

    /// The peer did not answer in time.
    #[error("request to {node} timed out")]
    Timeout {
        /// The peer.
        node: NodeId,
    },

    /// The peer answered with an error.
    #[error("{node} failed the request: {message}")]
    Remote {
        /// The peer.
        node: NodeId,
        /// Error text.
        message: String,
    },
}

impl TransportError {
    /// Returns true if a later attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }
}

/// Errors decoding a framed message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The API key is not known.
    #[error("unknown api key {key}")]
    UnknownApiKey {
        /// The key read.
        key: u8,
    },

    /// The version is not supported for this API key.
    #[error("unsupported version {version} for api key {api_key}")]
    UnsupportedVersion {
        /// The API key.
        api_key: u8,
        /// The version read.
        version: u16,
    },

    /// The frame ended early.
    #[error("frame truncated: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes needed.
        needed: usize,
        /// Bytes left.
        available: usize,
    },

    /// Bytes were left after the payload.
    #[error("{remaining} trailing bytes after payload")]
    TrailingBytes {
        /// Bytes left.
        remaining: usize,
    },

    /// A field held an impossible value.
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A carried batch failed verification.
    #[error("invalid batch: {0}")]
    Batch(#[from] CoreError),
}

/// Errors reading or writing vote state.
#[derive(Debug, Error)]
pub enum VoteStoreError {
    /// The file failed its checksum or framing.
    #[error("corrupt vote state: {reason}")]
    Corrupt {
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl VoteStoreError {
    /// Returns true if the stored state is damaged.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}
