//! Safety properties checked across a cluster's lifetime.
//!
//! A [`CommitHistory`] remembers every batch ever observed as committed on
//! any node, the highest commit index each node reported, and the leader
//! of every term. Observations that contradict the history are returned
//! as [`PropertyViolation`]s.

use std::collections::BTreeMap;
use std::fmt;

use keel_core::{NodeId, Offset, RecordBatch, TermId};

// ============================================================================
// Property Violation Types
// ============================================================================

/// A violation of a consensus safety property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyViolation {
    /// Two nodes committed different batches at the same offset.
    CommittedMismatch {
        /// Base offset of the batch.
        offset: Offset,
        /// Node that first committed a batch there.
        first: NodeId,
        /// Node that committed a different one.
        second: NodeId,
    },
    /// A node's commit index went backwards.
    CommitRegressed {
        /// The node.
        node: NodeId,
        /// Previously reported commit index.
        from: Offset,
        /// Newly reported commit index.
        to: Option<Offset>,
    },
    /// Two nodes led the same term.
    MultipleLeadersInTerm {
        /// The term.
        term: TermId,
        /// The leaders.
        leaders: Vec<NodeId>,
    },
}

impl fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommittedMismatch {
                offset,
                first,
                second,
            } => write!(
                f,
                "committed batch at {offset} differs between {first} and {second}"
            ),
            Self::CommitRegressed { node, from, to } => {
                write!(f, "{node} commit index went from {from} to {to:?}")
            }
            Self::MultipleLeadersInTerm { term, leaders } => {
                write!(f, "multiple leaders in {term}: {leaders:?}")
            }
        }
    }
}

// ============================================================================
// Commit History
// ============================================================================

#[derive(Debug)]
struct CommittedBatch {
    node: NodeId,
    batch: RecordBatch,
}

/// Everything observed as committed so far.
#[derive(Debug, Default)]
pub struct CommitHistory {
    batches: BTreeMap<Offset, CommittedBatch>,
    commit_index: BTreeMap<NodeId, Offset>,
    leaders: BTreeMap<TermId, NodeId>,
}

impl CommitHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct committed batches seen.
    #[must_use]
    pub fn committed_batches(&self) -> usize {
        self.batches.len()
    }

    /// Highest commit index any node reported.
    #[must_use]
    pub fn highest_commit(&self) -> Option<Offset> {
        self.commit_index.values().max().copied()
    }

    /// Records batches `node` reports as committed.
    ///
    /// # Errors
    /// Returns the first batch that differs from one committed earlier at
    /// the same offset.
    pub fn observe_committed(
        &mut self,
        node: NodeId,
        batches: &[RecordBatch],
    ) -> Result<(), PropertyViolation> {
        for batch in batches {
            match self.batches.get(&batch.base_offset()) {
                Some(seen) if seen.batch != *batch => {
                    return Err(PropertyViolation::CommittedMismatch {
                        offset: batch.base_offset(),
                        first: seen.node,
                        second: node,
                    });
                }
                Some(_) => {}
                None => {
                    self.batches.insert(
                        batch.base_offset(),
                        CommittedBatch {
                            node,
                            batch: batch.copy(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Records a node's commit index.
    ///
    /// # Errors
    /// Returns a violation if the index is lower than one reported before.
    pub fn observe_commit_index(
        &mut self,
        node: NodeId,
        commit: Option<Offset>,
    ) -> Result<(), PropertyViolation> {
        let previous = self.commit_index.get(&node).copied();
        match (previous, commit) {
            (Some(from), to) if to < Some(from) => {
                Err(PropertyViolation::CommitRegressed { node, from, to })
            }
            (_, Some(to)) => {
                self.commit_index.insert(node, to);
                Ok(())
            }
            (_, None) => Ok(()),
        }
    }

    /// Forgets a node's commit index. The index is volatile, so a restarted
    /// node may report a lower one.
    pub fn node_restarted(&mut self, node: NodeId) {
        self.commit_index.remove(&node);
    }

    /// Records that `node` led `term`.
    ///
    /// # Errors
    /// Returns a violation if another node already led that term.
    pub fn observe_leader(&mut self, term: TermId, node: NodeId) -> Result<(), PropertyViolation> {
        match self.leaders.get(&term) {
            Some(&other) if other != node => Err(PropertyViolation::MultipleLeadersInTerm {
                term,
                leaders: vec![other, node],
            }),
            Some(_) => Ok(()),
            None => {
                self.leaders.insert(term, node);
                Ok(())
            }
        }
    }
}
