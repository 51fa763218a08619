//! Strongly-typed identifiers for keel entities.
//!
//! Explicit types keep node ids, terms, groups and offsets from being mixed up.
//! All identifiers are 64-bit.

use std::fmt;
use std::path::PathBuf;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `NodeId` with `GroupId`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(NodeId, "node", "Unique identifier for a node in the cluster.");
define_id!(TermId, "term", "Raft term number for leader election.");
define_id!(GroupId, "group", "Unique identifier for a Raft group.");
define_id!(PartitionId, "partition", "Partition number within a topic.");

/// Position of a record in a partition log.
///
/// Offsets are dense: every record of every batch consumes exactly one.
/// "No offset yet" is expressed as `Option<Offset>::None` rather than a
/// sentinel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Offset(u64);

impl Offset {
    /// The first offset of every log.
    pub const ZERO: Self = Self(0);

    /// Creates an offset from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw offset value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the next offset.
    ///
    /// # Panics
    /// Panics if the offset would overflow.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        assert!(self.0 < u64::MAX, "offset overflow");
        Self(self.0 + 1)
    }

    /// Returns the previous offset, or `None` for offset zero.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Option<Self> {
        match self.0.checked_sub(1) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Returns this offset advanced by `delta`.
    #[inline]
    #[must_use]
    pub const fn add(self, delta: u64) -> Self {
        Self(self.0.saturating_add(delta))
    }

    /// Returns the offset following an optional last offset.
    ///
    /// `None` (empty log) maps to offset zero.
    #[inline]
    #[must_use]
    pub const fn after(last: Option<Self>) -> Self {
        match last {
            Some(o) => o.next(),
            None => Self::ZERO,
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Offset {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Namespace, topic and partition: the identity of one log.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ntp {
    /// Namespace the topic lives in.
    pub namespace: String,
    /// Topic name.
    pub topic: String,
    /// Partition number within the topic.
    pub partition: PartitionId,
}

impl Ntp {
    /// Creates a new NTP.
    #[must_use]
    pub fn new(namespace: impl Into<String>, topic: impl Into<String>, partition: u64) -> Self {
        Self {
            namespace: namespace.into(),
            topic: topic.into(),
            partition: PartitionId::new(partition),
        }
    }

    /// Relative directory holding this log: `<namespace>/<topic>/<partition>`.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        let mut path = PathBuf::from(&self.namespace);
        path.push(&self.topic);
        path.push(self.partition.get().to_string());
        path
    }
}

impl fmt::Display for Ntp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.topic, self.partition.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        let node = NodeId::new(42);
        assert_eq!(format!("{node}"), "node-42");
        assert_eq!(format!("{node:?}"), "node(42)");
    }

    #[test]
    fn test_id_next() {
        let term = TermId::new(0);
        assert_eq!(term.next().get(), 1);
        assert_eq!(term.next().next().get(), 2);
    }

    #[test]
    #[should_panic(expected = "ID overflow")]
    fn test_id_overflow_panics() {
        let _ = GroupId::new(u64::MAX).next();
    }

    #[test]
    fn test_offset_prev_and_after() {
        assert_eq!(Offset::ZERO.prev(), None);
        assert_eq!(Offset::new(10).prev(), Some(Offset::new(9)));
        assert_eq!(Offset::after(None), Offset::ZERO);
        assert_eq!(Offset::after(Some(Offset::new(4))), Offset::new(5));
    }

    #[test]
    fn test_offset_option_ordering() {
        // The empty sentinel sorts below every real offset.
        assert!(None < Some(Offset::ZERO));
        assert!(Some(Offset::new(1)) > Some(Offset::ZERO));
    }

    #[test]
    fn test_ntp_path() {
        let ntp = Ntp::new("kafka", "orders", 3);
        assert_eq!(ntp.path(), PathBuf::from("kafka/orders/3"));
        assert_eq!(ntp.to_string(), "kafka/orders/3");
    }
}
