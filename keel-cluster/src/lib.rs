//! Keel Cluster - partition placement.
//!
//! The [`PartitionAllocator`] decides which nodes and cores host the
//! replicas of a new topic's partitions. Each node is modelled as an
//! [`AllocationNode`]: one weight counter per core, where a partition
//! replica adds one unit of weight to the least loaded core.
//!
//! Allocation is transactional. [`PartitionAllocator::allocate`] hands back
//! [`AllocationUnits`] holding every reservation it made; unless the caller
//! commits them, dropping the units returns the capacity.
//!
//! # Design Principles
//!
//! - **No partial placement**: a topic is placed whole or not at all
//! - **Explicit limits**: per-core capacity is bounded
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod allocator;
mod error;
mod node;
mod types;

pub use allocator::{AllocationUnits, PartitionAllocator};
pub use error::{AllocatorError, AllocatorResult};
pub use node::AllocationNode;
pub use types::{BrokerShard, PartitionAssignment, TopicConfiguration, TopicErrorCode};

/// Placement limits.
pub mod limits {
    /// Partition replicas a single core may host.
    pub const MAX_ALLOCATIONS_PER_CORE: u32 = 7000;

    /// Weight core 0 starts with. Core 0 also serves node-wide work.
    pub const CORE0_EXTRA_WEIGHT: u32 = 2;

    /// Cores a node may register with.
    pub const CPUS_MAX: u32 = 1024;

    /// Partitions a single topic may have.
    pub const PARTITIONS_PER_TOPIC_MAX: i32 = 100_000;

    /// Longest topic or namespace name in bytes.
    pub const NAME_LENGTH_MAX: usize = 249;
}
