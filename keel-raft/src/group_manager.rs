//! Registry of the consensus groups hosted on one node.

use std::collections::HashMap;

use bytes::Bytes;
use futures::future::join_all;
use keel_core::{GroupId, NodeId};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::codec::{decode_request, encode_reply};
use crate::consensus::ConsensusGroup;
use crate::error::{RaftError, RaftResult};
use crate::message::{RaftReply, RaftRequest};

/// Routes inbound consensus traffic to the addressed group.
#[derive(Debug)]
pub struct GroupManager {
    node_id: NodeId,
    groups: RwLock<HashMap<GroupId, ConsensusGroup>>,
}

impl GroupManager {
    /// Creates an empty registry for `node_id`.
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// The hosting node.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Registers a started group.
    ///
    /// # Errors
    /// Returns [`RaftError::InvalidConfig`] if the group runs on another
    /// node or its ID is already registered.
    pub async fn add(&self, group: ConsensusGroup) -> RaftResult<()> {
        if group.node_id() != self.node_id {
            return Err(RaftError::InvalidConfig {
                reason: "group belongs to another node",
            });
        }
        let mut groups = self.groups.write().await;
        if groups.contains_key(&group.group_id()) {
            return Err(RaftError::InvalidConfig {
                reason: "group already registered",
            });
        }
        info!(node = %self.node_id, group = %group.group_id(), "group registered");
        groups.insert(group.group_id(), group);
        Ok(())
    }

    /// Unregisters a group and shuts it down.
    pub async fn remove(&self, group_id: GroupId) -> Option<ConsensusGroup> {
        let group = self.groups.write().await.remove(&group_id)?;
        group.shutdown().await;
        info!(node = %self.node_id, group = %group_id, "group removed");
        Some(group)
    }

    /// Looks up a group.
    pub async fn get(&self, group_id: GroupId) -> Option<ConsensusGroup> {
        self.groups.read().await.get(&group_id).cloned()
    }

    /// IDs of every registered group, sorted.
    pub async fn groups(&self) -> Vec<GroupId> {
        let mut ids: Vec<_> = self.groups.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Dispatches a request to its group.
    ///
    /// # Errors
    /// Returns [`RaftError::UnknownGroup`] for an unregistered group, or
    /// whatever the group returns.
    pub async fn handle(&self, request: RaftRequest) -> RaftResult<RaftReply> {
        let group_id = request.group();
        let Some(group) = self.get(group_id).await else {
            debug!(node = %self.node_id, group = %group_id, "request for unknown group");
            return Err(RaftError::UnknownGroup { group: group_id });
        };
        group.handle(request).await
    }

    /// Decodes a request frame, dispatches it and encodes the reply.
    ///
    /// # Errors
    /// Returns [`RaftError::Codec`] for a malformed frame, or the dispatch
    /// error.
    pub async fn handle_frame(&self, frame: Bytes) -> RaftResult<Bytes> {
        let request = decode_request(frame)?;
        let reply = self.handle(request).await?;
        Ok(encode_reply(&reply))
    }

    /// Shuts down and unregisters every group.
    pub async fn shutdown_all(&self) {
        let groups: Vec<_> = self.groups.write().await.drain().map(|(_, g)| g).collect();
        join_all(groups.iter().map(ConsensusGroup::shutdown)).await;
        info!(node = %self.node_id, count = groups.len(), "all groups shut down");
    }
}
