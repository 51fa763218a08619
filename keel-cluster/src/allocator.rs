//! Round-robin replica placement.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keel_core::{GroupId, NodeId};
use tracing::{debug, info, warn};

use crate::error::{AllocatorError, AllocatorResult};
use crate::limits::CPUS_MAX;
use crate::node::AllocationNode;
use crate::types::{BrokerShard, PartitionAssignment, TopicConfiguration};

#[derive(Debug)]
struct Placement {
    nodes: BTreeMap<NodeId, AllocationNode>,
    /// Registration order; the round-robin walks it.
    order: Vec<NodeId>,
    cursor: usize,
    highest_group: GroupId,
}

impl Placement {
    /// Picks `count` distinct nodes starting at the cursor and reserves the
    /// least loaded core on each. Nothing is reserved on failure.
    fn place_replicas(&mut self, count: usize) -> Option<Vec<BrokerShard>> {
        let len = self.order.len();
        if count == 0 || count > len {
            return None;
        }
        let mut replicas = Vec::with_capacity(count);
        for _ in 0..len {
            if replicas.len() == count {
                break;
            }
            let node_id = self.order[self.cursor];
            self.cursor = (self.cursor + 1) % len;
            let Some(node) = self.nodes.get_mut(&node_id) else {
                continue;
            };
            if node.is_decommissioned() {
                continue;
            }
            if let Some(shard) = node.allocate() {
                replicas.push(BrokerShard { node_id, shard });
            }
        }
        if replicas.len() < count {
            for replica in replicas {
                self.release(replica);
            }
            return None;
        }
        Some(replicas)
    }

    fn release(&mut self, replica: BrokerShard) -> bool {
        self.nodes
            .get_mut(&replica.node_id)
            .is_some_and(|node| node.deallocate(replica.shard))
    }

    fn release_all(&mut self, assignments: &[PartitionAssignment]) {
        for replica in assignments.iter().flat_map(|a| &a.replicas) {
            if !self.release(*replica) {
                warn!(%replica, "released replica was not allocated");
            }
        }
    }

    fn next_group(&mut self) -> GroupId {
        self.highest_group = self.highest_group.next();
        self.highest_group
    }
}

fn lock(placement: &Mutex<Placement>) -> MutexGuard<'_, Placement> {
    placement.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Places partition replicas across the registered nodes.
///
/// Cloning yields a handle to the same node set.
#[derive(Debug, Clone)]
pub struct PartitionAllocator {
    placement: Arc<Mutex<Placement>>,
}

impl PartitionAllocator {
    /// Creates an allocator with no nodes. New groups are numbered after
    /// `highest_group`.
    #[must_use]
    pub fn new(highest_group: GroupId) -> Self {
        Self {
            placement: Arc::new(Mutex::new(Placement {
                nodes: BTreeMap::new(),
                order: Vec::new(),
                cursor: 0,
                highest_group,
            })),
        }
    }

    /// Adds a node with `cpus` cores.
    ///
    /// # Errors
    /// Returns an error if the node is already registered or `cpus` is zero
    /// or above [`CPUS_MAX`].
    pub fn register_node(
        &self,
        node_id: NodeId,
        cpus: u32,
        labels: BTreeMap<String, String>,
    ) -> AllocatorResult<()> {
        if cpus == 0 || cpus > CPUS_MAX {
            return Err(AllocatorError::InvalidCpuCount { node: node_id, cpus });
        }
        let mut placement = lock(&self.placement);
        if placement.nodes.contains_key(&node_id) {
            return Err(AllocatorError::DuplicateNode { node: node_id });
        }
        placement
            .nodes
            .insert(node_id, AllocationNode::new(node_id, cpus, labels));
        placement.order.push(node_id);
        info!(node = %node_id, cpus, "node registered for allocation");
        Ok(())
    }

    /// Keeps new replicas off a node. Existing placements stay.
    ///
    /// # Errors
    /// Returns [`AllocatorError::UnknownNode`] for an unregistered node.
    pub fn decommission(&self, node_id: NodeId) -> AllocatorResult<()> {
        self.set_decommissioned(node_id, true)
    }

    /// Makes a decommissioned node eligible again.
    ///
    /// # Errors
    /// Returns [`AllocatorError::UnknownNode`] for an unregistered node.
    pub fn recommission(&self, node_id: NodeId) -> AllocatorResult<()> {
        self.set_decommissioned(node_id, false)
    }

    fn set_decommissioned(&self, node_id: NodeId, decommissioned: bool) -> AllocatorResult<()> {
        let mut placement = lock(&self.placement);
        let node = placement
            .nodes
            .get_mut(&node_id)
            .ok_or(AllocatorError::UnknownNode { node: node_id })?;
        node.set_decommissioned(decommissioned);
        info!(node = %node_id, decommissioned, "node allocation state changed");
        Ok(())
    }

    /// Removes a node and returns its final state. Later releases of its
    /// replicas are ignored.
    ///
    /// # Errors
    /// Returns [`AllocatorError::UnknownNode`] for an unregistered node.
    pub fn unregister(&self, node_id: NodeId) -> AllocatorResult<AllocationNode> {
        let mut placement = lock(&self.placement);
        let node = placement
            .nodes
            .remove(&node_id)
            .ok_or(AllocatorError::UnknownNode { node: node_id })?;
        placement.order.retain(|&id| id != node_id);
        placement.cursor = if placement.order.is_empty() {
            0
        } else {
            placement.cursor % placement.order.len()
        };
        info!(node = %node_id, allocated = node.allocated(), "node unregistered");
        Ok(node)
    }

    /// Snapshot of one node.
    #[must_use]
    pub fn node(&self, node_id: NodeId) -> Option<AllocationNode> {
        lock(&self.placement).nodes.get(&node_id).cloned()
    }

    /// Registered nodes, sorted.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        lock(&self.placement).nodes.keys().copied().collect()
    }

    /// Highest group ID handed out so far.
    #[must_use]
    pub fn highest_group(&self) -> GroupId {
        lock(&self.placement).highest_group
    }

    /// Places every partition of a topic.
    ///
    /// Each partition gets `replication_factor` distinct, eligible nodes in
    /// round-robin order and the least loaded core on each. Returns `None`,
    /// leaving no trace, if the configuration is invalid or any partition
    /// cannot be placed.
    #[must_use]
    pub fn allocate(&self, config: &TopicConfiguration) -> Option<AllocationUnits> {
        if let Err(code) = config.validate() {
            debug!(topic = %config.topic, %code, "not allocating invalid topic");
            return None;
        }
        let replicas_per_partition = usize::try_from(config.replication_factor).ok()?;
        let partitions = u32::try_from(config.partition_count).ok()?;

        let mut placement = lock(&self.placement);
        let cursor = placement.cursor;
        let mut placed = Vec::with_capacity(partitions as usize);
        for _ in 0..partitions {
            if let Some(replicas) = placement.place_replicas(replicas_per_partition) {
                placed.push(replicas);
            } else {
                for replica in placed.into_iter().flatten() {
                    placement.release(replica);
                }
                placement.cursor = cursor;
                debug!(
                    topic = %config.topic,
                    partitions,
                    replication_factor = config.replication_factor,
                    "not enough capacity to place topic"
                );
                return None;
            }
        }

        let assignments: Vec<_> = placed
            .into_iter()
            .zip(0..)
            .map(|(replicas, partition)| PartitionAssignment {
                group: placement.next_group(),
                ntp: config.ntp(partition),
                replicas,
            })
            .collect();
        drop(placement);

        info!(
            topic = %config.topic,
            partitions,
            replication_factor = config.replication_factor,
            "topic placed"
        );
        Some(AllocationUnits {
            placement: Arc::clone(&self.placement),
            assignments,
        })
    }

    /// Releases a committed assignment. Replicas on unregistered nodes are
    /// skipped.
    pub fn deallocate(&self, assignment: &PartitionAssignment) {
        lock(&self.placement).release_all(std::slice::from_ref(assignment));
        debug!(group = %assignment.group, ntp = %assignment.ntp, "assignment released");
    }

    /// Reapplies placements recovered from cluster metadata and raises the
    /// group counter past them. All or nothing.
    ///
    /// # Errors
    /// Returns an error naming the first replica that cannot be applied.
    pub fn update_allocation_state(&self, assignments: &[PartitionAssignment]) -> AllocatorResult<()> {
        let mut placement = lock(&self.placement);
        let mut applied: Vec<BrokerShard> = Vec::new();
        for replica in assignments.iter().flat_map(|a| &a.replicas) {
            let result = match placement.nodes.get_mut(&replica.node_id) {
                None => Err(AllocatorError::UnknownNode { node: replica.node_id }),
                Some(node) => {
                    if replica.shard >= node.cpus() {
                        Err(AllocatorError::UnknownShard {
                            node: replica.node_id,
                            shard: replica.shard,
                        })
                    } else if !node.allocate_on(replica.shard) {
                        Err(AllocatorError::ShardFull {
                            node: replica.node_id,
                            shard: replica.shard,
                        })
                    } else {
                        Ok(())
                    }
                }
            };
            if let Err(err) = result {
                for done in applied {
                    placement.release(done);
                }
                return Err(err);
            }
            applied.push(*replica);
        }
        if let Some(max) = assignments.iter().map(|a| a.group).max() {
            placement.highest_group = placement.highest_group.max(max);
        }
        info!(
            assignments = assignments.len(),
            highest_group = %placement.highest_group,
            "allocation state recovered"
        );
        Ok(())
    }
}

/// Reservations made by one [`PartitionAllocator::allocate`] call.
///
/// Dropping the units without calling [`commit`](Self::commit) returns every
/// reservation to its node. Group IDs are not reused.
#[derive(Debug)]
#[must_use = "dropping uncommitted units releases their capacity"]
pub struct AllocationUnits {
    placement: Arc<Mutex<Placement>>,
    assignments: Vec<PartitionAssignment>,
}

impl AllocationUnits {
    /// The pending assignments, one per partition.
    #[must_use]
    pub fn assignments(&self) -> &[PartitionAssignment] {
        &self.assignments
    }

    /// Keeps the reservations and hands over the assignments.
    #[must_use]
    pub fn commit(mut self) -> Vec<PartitionAssignment> {
        std::mem::take(&mut self.assignments)
    }
}

impl Drop for AllocationUnits {
    fn drop(&mut self) {
        if self.assignments.is_empty() {
            return;
        }
        lock(&self.placement).release_all(&self.assignments);
        debug!(partitions = self.assignments.len(), "uncommitted allocation released");
    }
}
