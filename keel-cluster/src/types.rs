//! Topic configuration and placement results.

use std::fmt;
use std::time::Duration;

use keel_core::{Compression, GroupId, NodeId, Ntp};
use thiserror::Error;

use crate::limits::{NAME_LENGTH_MAX, PARTITIONS_PER_TOPIC_MAX};

/// Outcome codes for topic operations, as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(i16)]
pub enum TopicErrorCode {
    /// Success.
    #[error("no_error")]
    NoError = 0,
    /// Unclassified failure.
    #[error("unknown_error")]
    UnknownError = 1,
    /// The operation did not finish in time.
    #[error("time_out")]
    TimeOut = 2,
    /// Partition count is out of range.
    #[error("invalid_partitions")]
    InvalidPartitions = 3,
    /// Replication factor is out of range or cannot be placed.
    #[error("invalid_replication_factor")]
    InvalidReplicationFactor = 4,
    /// Some other configuration value is invalid.
    #[error("invalid_config")]
    InvalidConfig = 5,
    /// The request reached a node that does not lead the controller.
    #[error("not_leader_controller")]
    NotLeaderController = 6,
}

impl TopicErrorCode {
    /// Creates a code from its wire value.
    #[must_use]
    pub const fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::NoError),
            1 => Some(Self::UnknownError),
            2 => Some(Self::TimeOut),
            3 => Some(Self::InvalidPartitions),
            4 => Some(Self::InvalidReplicationFactor),
            5 => Some(Self::InvalidConfig),
            6 => Some(Self::NotLeaderController),
            _ => None,
        }
    }

    /// Wire value.
    #[must_use]
    pub const fn as_i16(self) -> i16 {
        self as i16
    }
}

/// Settings a topic is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfiguration {
    /// Namespace of the topic.
    pub namespace: String,
    /// Topic name.
    pub topic: String,
    /// Number of partitions.
    pub partition_count: i32,
    /// Replicas per partition.
    pub replication_factor: i16,
    /// Compression producers are expected to use.
    pub compression: Compression,
    /// Key-based compaction instead of deletion-based retention.
    pub compacted: bool,
    /// Size bound per partition, if any.
    pub retention_bytes: Option<u64>,
    /// Age bound, if any.
    pub retention: Option<Duration>,
}

impl TopicConfiguration {
    /// Creates a configuration with no compression and unbounded retention.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        topic: impl Into<String>,
        partition_count: i32,
        replication_factor: i16,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            topic: topic.into(),
            partition_count,
            replication_factor,
            compression: Compression::None,
            compacted: false,
            retention_bytes: None,
            retention: None,
        }
    }

    /// Sets the compression.
    #[must_use]
    pub const fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Sets key-based compaction.
    #[must_use]
    pub const fn with_compaction(mut self, compacted: bool) -> Self {
        self.compacted = compacted;
        self
    }

    /// Sets the per-partition size bound.
    #[must_use]
    pub const fn with_retention_bytes(mut self, bytes: u64) -> Self {
        self.retention_bytes = Some(bytes);
        self
    }

    /// Sets the age bound.
    #[must_use]
    pub const fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// NTP of one partition of this topic.
    ///
    /// # Panics
    /// Panics in debug builds if `partition` is outside the partition count.
    #[must_use]
    pub fn ntp(&self, partition: u32) -> Ntp {
        debug_assert!(i64::from(partition) < i64::from(self.partition_count));
        Ntp::new(self.namespace.clone(), self.topic.clone(), u64::from(partition))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns the code a client should see for the first invalid field.
    pub fn validate(&self) -> Result<(), TopicErrorCode> {
        if !valid_name(&self.namespace) || !valid_name(&self.topic) {
            return Err(TopicErrorCode::InvalidConfig);
        }
        if self.partition_count <= 0 || self.partition_count > PARTITIONS_PER_TOPIC_MAX {
            return Err(TopicErrorCode::InvalidPartitions);
        }
        if self.replication_factor <= 0 {
            return Err(TopicErrorCode::InvalidReplicationFactor);
        }
        if self.retention_bytes == Some(0) || self.retention == Some(Duration::ZERO) {
            return Err(TopicErrorCode::InvalidConfig);
        }
        Ok(())
    }
}

/// Names become directory components.
fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= NAME_LENGTH_MAX
        && name != "."
        && name != ".."
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// One core on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrokerShard {
    /// The node.
    pub node_id: NodeId,
    /// Core index on the node.
    pub shard: u32,
}

impl fmt::Display for BrokerShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/core-{}", self.node_id, self.shard)
    }
}

/// Placement of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignment {
    /// Consensus group replicating the partition.
    pub group: GroupId,
    /// The partition.
    pub ntp: Ntp,
    /// Hosting cores, one per replica, on distinct nodes.
    pub replicas: Vec<BrokerShard>,
}

impl PartitionAssignment {
    /// Nodes hosting a replica, in placement order.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeId> {
        self.replicas.iter().map(|r| r.node_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_defaults() {
        let config = TopicConfiguration::new("kafka", "orders", 3, 3)
            .with_compression(Compression::Zstd)
            .with_retention_bytes(1 << 30)
            .with_retention(Duration::from_secs(3600));
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.ntp(2), Ntp::new("kafka", "orders", 2));
    }

    #[test]
    fn test_validate_rejects_bad_counts() {
        let bad = |p, r| TopicConfiguration::new("kafka", "t", p, r).validate();
        assert_eq!(bad(0, 1), Err(TopicErrorCode::InvalidPartitions));
        assert_eq!(bad(-4, 1), Err(TopicErrorCode::InvalidPartitions));
        assert_eq!(bad(PARTITIONS_PER_TOPIC_MAX + 1, 1), Err(TopicErrorCode::InvalidPartitions));
        assert_eq!(bad(1, 0), Err(TopicErrorCode::InvalidReplicationFactor));
        assert_eq!(bad(1, -1), Err(TopicErrorCode::InvalidReplicationFactor));
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        for name in ["", ".", "..", "a/b", "spaced name", &"x".repeat(NAME_LENGTH_MAX + 1)] {
            let config = TopicConfiguration::new("kafka", name, 1, 1);
            assert_eq!(config.validate(), Err(TopicErrorCode::InvalidConfig), "{name:?}");
        }
        let zero = TopicConfiguration::new("kafka", "t", 1, 1).with_retention_bytes(0);
        assert_eq!(zero.validate(), Err(TopicErrorCode::InvalidConfig));
    }

    #[test]
    fn test_error_code_wire_values() {
        for code in 0..=6 {
            let parsed = TopicErrorCode::from_i16(code).unwrap();
            assert_eq!(parsed.as_i16(), code);
        }
        assert_eq!(TopicErrorCode::from_i16(7), None);
        assert_eq!(TopicErrorCode::InvalidPartitions.to_string(), "invalid_partitions");
    }
}
