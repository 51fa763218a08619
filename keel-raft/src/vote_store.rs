//! Durable term and vote.
//!
//! A node must never vote twice in one term, even across a crash, so the
//! current term and vote are synced to disk before any vote reply or
//! candidacy request leaves the node.
//!
//! ```text
//! magic u32 | version u32 | term u64 | has_vote u8 | voted_for u64 | crc32 u32
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use keel_core::{NodeId, TermId};
use keel_storage::{Storage, TEMP_SUFFIX};
use tracing::debug;

use crate::error::VoteStoreError;

/// File name inside a group's log directory.
pub const VOTE_FILE_NAME: &str = "vote.state";

const VOTE_MAGIC: u32 = 0x564F_5445; // "VOTE"
const VOTE_VERSION: u32 = 1;
const VOTE_SIZE: usize = 4 + 4 + 8 + 1 + 8 + 4;

/// Persistent election state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoteState {
    /// Latest term seen.
    pub term: TermId,
    /// Candidate voted for in `term`.
    pub voted_for: Option<NodeId>,
}

impl VoteState {
    fn encode(self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(VOTE_SIZE);
        buf.put_u32_le(VOTE_MAGIC);
        buf.put_u32_le(VOTE_VERSION);
        buf.put_u64_le(self.term.get());
        buf.put_u8(u8::from(self.voted_for.is_some()));
        buf.put_u64_le(self.voted_for.map_or(0, NodeId::get));
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf
    }

    fn decode(mut data: &[u8]) -> Result<Self, VoteStoreError> {
        let corrupt = |reason| VoteStoreError::Corrupt { reason };
        if data.len() != VOTE_SIZE {
            return Err(corrupt("wrong size"));
        }
        let stored_crc = (&data[VOTE_SIZE - 4..]).get_u32_le();
        if crc32fast::hash(&data[..VOTE_SIZE - 4]) != stored_crc {
            return Err(corrupt("checksum mismatch"));
        }
        if data.get_u32_le() != VOTE_MAGIC {
            return Err(corrupt("bad magic"));
        }
        if data.get_u32_le() != VOTE_VERSION {
            return Err(corrupt("unsupported version"));
        }
        let term = TermId::new(data.get_u64_le());
        let has_vote = data.get_u8() != 0;
        let voted_for = data.get_u64_le();
        Ok(Self {
            term,
            voted_for: has_vote.then(|| NodeId::new(voted_for)),
        })
    }
}

/// Reads and writes one group's [`VoteState`].
#[derive(Debug, Clone)]
pub struct VoteStore {
    storage: Arc<dyn Storage>,
    path: PathBuf,
}

impl VoteStore {
    /// Creates a store for the vote file in `dir`.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, dir: &Path) -> Self {
        Self {
            storage,
            path: dir.join(VOTE_FILE_NAME),
        }
    }

    /// Path of the vote file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the saved state; a missing file is term zero with no vote.
    ///
    /// # Errors
    /// Returns an error if the file is damaged or unreadable.
    pub async fn load(&self) -> Result<VoteState, VoteStoreError> {
        if !self.storage.exists(&self.path).await? {
            return Ok(VoteState::default());
        }
        let data = self.storage.open(&self.path).await?.read_all().await?;
        VoteState::decode(&data)
    }

    /// Atomically replaces the saved state.
    ///
    /// # Errors
    /// Returns an error if writing, syncing or renaming fails.
    pub async fn save(&self, state: VoteState) -> Result<(), VoteStoreError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(TEMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let file = self.storage.open(&tmp).await?;
        file.truncate(0).await?;
        file.write_at(0, &state.encode()).await?;
        file.sync().await?;
        drop(file);
        self.storage.rename(&tmp, &self.path).await?;

        debug!(
            path = %self.path.display(),
            term = state.term.get(),
            voted_for = ?state.voted_for,
            "saved vote state"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_storage::{FaultConfig, SimulatedStorage};

    fn dir() -> &'static Path {
        Path::new("/data/ns/t/0")
    }

    #[test]
    fn test_vote_file_is_left_alone_by_log_recovery() {
        assert!(VOTE_FILE_NAME.ends_with(keel_storage::STATE_FILE_EXTENSION));
    }

    #[tokio::test]
    async fn test_vote_file_survives_log_reopen() {
        let storage = SimulatedStorage::new();
        let store = VoteStore::new(Arc::new(storage.clone()), dir());
        let state = VoteState {
            term: TermId::new(3),
            voted_for: Some(NodeId::new(2)),
        };
        store.save(state).await.unwrap();

        let log = keel_storage::Log::open(
            keel_core::Ntp::new("ns", "t", 0),
            dir().to_path_buf(),
            Arc::new(storage.clone()),
            keel_storage::LogConfig::new(),
        )
        .await
        .unwrap();
        assert!(log.recovery().is_clean());
        assert_eq!(store.load().await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_missing_file_is_default() {
        let store = VoteStore::new(Arc::new(SimulatedStorage::new()), dir());
        assert_eq!(store.load().await.unwrap(), VoteState::default());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let storage = Arc::new(SimulatedStorage::new());
        let store = VoteStore::new(storage.clone(), dir());
        let state = VoteState {
            term: TermId::new(7),
            voted_for: Some(NodeId::new(3)),
        };
        store.save(state).await.unwrap();

        let reopened = VoteStore::new(storage, dir());
        assert_eq!(reopened.load().await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_corruption_detected() {
        let storage = Arc::new(SimulatedStorage::new());
        let store = VoteStore::new(storage.clone(), dir());
        store
            .save(VoteState {
                term: TermId::new(2),
                voted_for: None,
            })
            .await
            .unwrap();
        storage.corrupt_bytes(store.path(), 9, 1);
        assert!(store.load().await.unwrap_err().is_corruption());
    }

    #[tokio::test]
    async fn test_failed_sync_keeps_previous_state() {
        let storage = Arc::new(SimulatedStorage::new());
        let store = VoteStore::new(storage.clone(), dir());
        let first = VoteState {
            term: TermId::new(1),
            voted_for: Some(NodeId::new(1)),
        };
        store.save(first).await.unwrap();

        *storage.faults() = FaultConfig::none().with_fsync_fail();
        let second = VoteState {
            term: TermId::new(2),
            voted_for: Some(NodeId::new(2)),
        };
        assert!(store.save(second).await.is_err());

        *storage.faults() = FaultConfig::none();
        assert_eq!(store.load().await.unwrap(), first);
    }
}
