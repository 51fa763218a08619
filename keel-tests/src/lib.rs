//! Keel Tests - multi-node simulation tests for keel.
//!
//! Consensus groups run on the tokio runtime with a paused clock, talk over
//! an in-memory [`network::SimulatedNetwork`] that frames every message
//! with the wire codec, and store their logs on
//! [`keel_storage::SimulatedStorage`] so crashes and recovery are
//! deterministic.
//!
//! ## Test Organization
//!
//! - `raft_tests`: elections, commit, crash and partition scenarios
//! - `fault_tests`: seeded random fault schedules checked for safety
//! - `recovery_tests`: snapshot install and damaged-tail recovery
//! - `placement_tests`: allocator-driven placement of many groups
//!
//! **Support Modules**:
//! - `network`: in-memory transport with partitions
//! - `cluster`: node lifecycle harness
//! - `properties`: safety properties (`CommitHistory`)
//!
//! ## Naming Conventions
//!
//! - Integration tests: `test_<component>_<scenario>`
//! - Unit tests: inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cluster;
pub mod network;
pub mod properties;

#[cfg(test)]
mod fault_tests;
#[cfg(test)]
mod placement_tests;

use tracing_subscriber::EnvFilter;

/// Seeds for reproducible fault schedules.
pub mod seeds {
    /// Seeds that have exercised interesting interleavings.
    pub const REGRESSION_SEEDS: &[u64] = &[42, 12345, 0xDEAD_BEEF, 999, 7777, 0x1337, 1, 0];
}

/// Installs a test-friendly subscriber filtered by `RUST_LOG` (default
/// `warn`). Safe to call from every test.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
