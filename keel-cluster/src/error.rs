//! Allocator errors.

use keel_core::NodeId;
use thiserror::Error;

/// Result type for node registration.
pub type AllocatorResult<T> = Result<T, AllocatorError>;

/// Errors from managing the allocator's node set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocatorError {
    /// The node is already registered.
    #[error("{node} is already registered")]
    DuplicateNode {
        /// The node.
        node: NodeId,
    },

    /// The node is not registered.
    #[error("{node} is not registered")]
    UnknownNode {
        /// The node.
        node: NodeId,
    },

    /// The node's core count is zero or above the limit.
    #[error("{node} registered with invalid core count {cpus}")]
    InvalidCpuCount {
        /// The node.
        node: NodeId,
        /// Requested core count.
        cpus: u32,
    },

    /// An assignment names a core the node does not have.
    #[error("{node} has no core {shard}")]
    UnknownShard {
        /// The node.
        node: NodeId,
        /// Requested core.
        shard: u32,
    },

    /// The core cannot take another replica.
    #[error("{node} core {shard} is at capacity")]
    ShardFull {
        /// The node.
        node: NodeId,
        /// The core.
        shard: u32,
    },
}
