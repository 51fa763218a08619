//! Per-node capacity model.

use std::collections::BTreeMap;

use keel_core::NodeId;

use crate::limits::{CORE0_EXTRA_WEIGHT, MAX_ALLOCATIONS_PER_CORE};

/// One node's cores and their load.
///
/// Every core has a weight counting the replicas it hosts; core 0 starts
/// at [`CORE0_EXTRA_WEIGHT`]. No weight exceeds
/// [`MAX_ALLOCATIONS_PER_CORE`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationNode {
    id: NodeId,
    weights: Vec<u32>,
    capacity: u32,
    labels: BTreeMap<String, String>,
    decommissioned: bool,
}

impl AllocationNode {
    /// Creates an idle node with `cpus` cores.
    ///
    /// # Panics
    /// Panics in debug builds if `cpus` is zero.
    #[must_use]
    pub fn new(id: NodeId, cpus: u32, labels: BTreeMap<String, String>) -> Self {
        debug_assert!(cpus > 0, "node needs at least one core");
        let mut weights = vec![0; cpus as usize];
        weights[0] = CORE0_EXTRA_WEIGHT;
        Self {
            id,
            weights,
            capacity: cpus * MAX_ALLOCATIONS_PER_CORE - CORE0_EXTRA_WEIGHT,
            labels,
            decommissioned: false,
        }
    }

    /// Node ID.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Number of cores.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Bounded by CPUS_MAX at registration.
    pub fn cpus(&self) -> u32 {
        self.weights.len() as u32
    }

    /// Current weight of each core.
    #[must_use]
    pub fn weights(&self) -> &[u32] {
        &self.weights
    }

    /// Replicas the node can still take.
    #[must_use]
    pub const fn partition_capacity(&self) -> u32 {
        self.capacity
    }

    /// Replicas currently placed on the node.
    #[must_use]
    pub fn allocated(&self) -> u32 {
        self.weights.iter().sum::<u32>() - CORE0_EXTRA_WEIGHT
    }

    /// Node labels.
    #[must_use]
    pub const fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Whether new replicas are kept off this node.
    #[must_use]
    pub const fn is_decommissioned(&self) -> bool {
        self.decommissioned
    }

    pub(crate) fn set_decommissioned(&mut self, decommissioned: bool) {
        self.decommissioned = decommissioned;
    }

    /// Whether every core is at its limit.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.weights.iter().all(|&w| w >= MAX_ALLOCATIONS_PER_CORE)
    }

    /// Places one replica on the least loaded core and returns the core.
    /// Ties go to the lowest core index.
    pub(crate) fn allocate(&mut self) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        let (core, _) = self
            .weights
            .iter()
            .enumerate()
            .min_by_key(|&(i, &w)| (w, i))?;
        self.take(core);
        #[allow(clippy::cast_possible_truncation)] // Bounded by CPUS_MAX.
        Some(core as u32)
    }

    /// Places one replica on a specific core.
    pub(crate) fn allocate_on(&mut self, core: u32) -> bool {
        let core = core as usize;
        match self.weights.get(core) {
            Some(&w) if w < MAX_ALLOCATIONS_PER_CORE => {
                self.take(core);
                true
            }
            _ => false,
        }
    }

    fn take(&mut self, core: usize) {
        debug_assert!(self.capacity > 0);
        self.weights[core] += 1;
        self.capacity -= 1;
        debug_assert!(self.weights[core] <= MAX_ALLOCATIONS_PER_CORE);
    }

    /// Removes one replica from `core`. Returns false if the core holds none.
    pub(crate) fn deallocate(&mut self, core: u32) -> bool {
        let floor = if core == 0 { CORE0_EXTRA_WEIGHT } else { 0 };
        match self.weights.get_mut(core as usize) {
            Some(w) if *w > floor => {
                *w -= 1;
                self.capacity += 1;
                true
            }
            _ => false,
        }
    }
}
