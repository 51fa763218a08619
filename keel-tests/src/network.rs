//! In-memory network between consensus groups.
//!
//! Every request is framed with the wire codec, delivered to the target
//! node's [`GroupManager`] and the reply decoded on the way back, so the
//! tests exercise the same bytes a socket transport would carry.
//!
//! Nodes can be disabled (all traffic to and from them is dropped) and
//! links can be cut in one direction, which models asymmetric partitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use keel_core::NodeId;
use keel_raft::{
    decode_reply, encode_request, GroupManager, RaftReply, RaftRequest, Transport, TransportError,
};
use tracing::trace;

#[derive(Debug, Default)]
struct NetworkState {
    nodes: HashMap<NodeId, Arc<GroupManager>>,
    disabled: HashSet<NodeId>,
    /// Directed links that drop traffic: `(from, to)`.
    cut: HashSet<(NodeId, NodeId)>,
}

impl NetworkState {
    fn route(&self, from: NodeId, to: NodeId) -> Option<Arc<GroupManager>> {
        if self.disabled.contains(&from)
            || self.disabled.contains(&to)
            || self.cut.contains(&(from, to))
        {
            return None;
        }
        self.nodes.get(&to).cloned()
    }
}

/// A shared in-memory network. Clones see the same topology.
#[derive(Debug, Clone, Default)]
pub struct SimulatedNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl SimulatedNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a node's group registry.
    pub fn attach(&self, node: NodeId, manager: Arc<GroupManager>) {
        self.lock().nodes.insert(node, manager);
    }

    /// Detaches a node, as if its process died.
    pub fn detach(&self, node: NodeId) {
        self.lock().nodes.remove(&node);
    }

    /// A transport sending from `node`.
    #[must_use]
    pub fn transport(&self, node: NodeId) -> Arc<dyn Transport> {
        Arc::new(NetworkTransport {
            from: node,
            network: self.clone(),
        })
    }

    /// Drops all traffic to and from `node`.
    pub fn disable(&self, node: NodeId) {
        self.lock().disabled.insert(node);
    }

    /// Undoes [`SimulatedNetwork::disable`].
    pub fn enable(&self, node: NodeId) {
        self.lock().disabled.remove(&node);
    }

    /// Cuts every link between the two sides, both directions.
    pub fn partition(&self, side_a: &[NodeId], side_b: &[NodeId]) {
        let mut state = self.lock();
        for &a in side_a {
            for &b in side_b {
                state.cut.insert((a, b));
                state.cut.insert((b, a));
            }
        }
    }

    /// Cuts the link from `from` to `to` only.
    pub fn cut_link(&self, from: NodeId, to: NodeId) {
        self.lock().cut.insert((from, to));
    }

    /// Restores every cut link and disabled node.
    pub fn heal(&self) {
        let mut state = self.lock();
        state.cut.clear();
        state.disabled.clear();
    }

    fn route(&self, from: NodeId, to: NodeId) -> Option<Arc<GroupManager>> {
        self.lock().route(from, to)
    }
}

/// One node's view of a [`SimulatedNetwork`].
#[derive(Debug)]
struct NetworkTransport {
    from: NodeId,
    network: SimulatedNetwork,
}

#[async_trait]
impl Transport for NetworkTransport {
    async fn send(&self, target: NodeId, request: RaftRequest) -> Result<RaftReply, TransportError> {
        let Some(manager) = self.network.route(self.from, target) else {
            trace!(from = %self.from, to = %target, "request dropped");
            return Err(TransportError::Unreachable { node: target });
        };
        let frame = encode_request(&request);
        let reply = manager
            .handle_frame(frame)
            .await
            .map_err(|err| TransportError::Remote {
                node: target,
                message: err.to_string(),
            })?;

        // The reply travels the reverse link, which may have been cut while
        // the request was handled.
        if self.network.route(target, self.from).is_none() {
            trace!(from = %target, to = %self.from, "reply dropped");
            return Err(TransportError::Unreachable { node: target });
        }
        decode_reply(reply).map_err(|err| TransportError::Remote {
            node: target,
            message: err.to_string(),
        })
    }
}
