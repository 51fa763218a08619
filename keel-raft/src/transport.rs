//! The seam between consensus groups and the network.

use async_trait::async_trait;
use keel_core::NodeId;

use crate::error::TransportError;
use crate::message::{RaftReply, RaftRequest};

/// Delivers requests to peers and returns their replies.
///
/// Implementations must not reorder a reply onto a different request and
/// must fail with [`TransportError::Unreachable`] rather than block when a
/// peer cannot be reached. Timeouts are applied by the caller.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Sends `request` to `target` and waits for its reply.
    async fn send(&self, target: NodeId, request: RaftRequest) -> Result<RaftReply, TransportError>;
}
