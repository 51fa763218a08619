//! Persisted log start.
//!
//! After a prefix truncation or a snapshot reset the first retained offset
//! may lie past every segment, so it is recorded in `prefix.meta` alongside
//! the term of the offset just before it.
//!
//! ```text
//! magic u32 | version u32 | start_offset u64 | has_term u8 | term u64 | crc32 u32
//! ```

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use keel_core::{Offset, TermId};

use crate::error::{StorageError, StorageResult};
use crate::log::TEMP_SUFFIX;
use crate::storage::Storage;

/// File name inside a log directory.
pub const PREFIX_FILE_NAME: &str = "prefix.meta";

const PREFIX_MAGIC: u32 = 0x4B50_4658; // "KPFX"
const PREFIX_VERSION: u32 = 1;
const PREFIX_SIZE: usize = 4 + 4 + 8 + 1 + 8 + 4;

/// The retained start of a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixMeta {
    /// First retained offset.
    pub start_offset: Offset,
    /// Term of `start_offset - 1`, if known.
    pub term: Option<TermId>,
}

impl PrefixMeta {
    fn encode(self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(PREFIX_SIZE);
        buf.put_u32_le(PREFIX_MAGIC);
        buf.put_u32_le(PREFIX_VERSION);
        buf.put_u64_le(self.start_offset.get());
        buf.put_u8(u8::from(self.term.is_some()));
        buf.put_u64_le(self.term.map_or(0, TermId::get));
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf
    }

    fn decode(path: &Path, mut data: &[u8]) -> StorageResult<Self> {
        let invalid = |reason| StorageError::InvalidMetadata {
            path: path.display().to_string(),
            reason,
        };
        if data.len() != PREFIX_SIZE {
            return Err(invalid("wrong size"));
        }
        let stored_crc = (&data[PREFIX_SIZE - 4..]).get_u32_le();
        if crc32fast::hash(&data[..PREFIX_SIZE - 4]) != stored_crc {
            return Err(invalid("checksum mismatch"));
        }
        if data.get_u32_le() != PREFIX_MAGIC {
            return Err(invalid("bad magic"));
        }
        if data.get_u32_le() != PREFIX_VERSION {
            return Err(invalid("unsupported version"));
        }
        let start_offset = Offset::new(data.get_u64_le());
        let has_term = data.get_u8() != 0;
        let term = data.get_u64_le();
        Ok(Self {
            start_offset,
            term: has_term.then(|| TermId::new(term)),
        })
    }
}

fn prefix_path(dir: &Path) -> PathBuf {
    dir.join(PREFIX_FILE_NAME)
}

/// Loads the prefix record of the log in `dir`, if one was written.
///
/// # Errors
/// Returns [`StorageError::InvalidMetadata`] for a damaged file.
pub async fn load(storage: &dyn Storage, dir: &Path) -> StorageResult<Option<PrefixMeta>> {
    let path = prefix_path(dir);
    if !storage.exists(&path).await? {
        return Ok(None);
    }
    let data = storage.open(&path).await?.read_all().await?;
    PrefixMeta::decode(&path, &data).map(Some)
}

/// Atomically replaces the prefix record of the log in `dir`.
///
/// # Errors
/// Returns an error if writing, syncing or renaming fails.
pub async fn store(storage: &dyn Storage, dir: &Path, meta: PrefixMeta) -> StorageResult<()> {
    let path = prefix_path(dir);
    let tmp = dir.join(format!("{PREFIX_FILE_NAME}{TEMP_SUFFIX}"));
    let file = storage.open(&tmp).await?;
    file.truncate(0).await?;
    file.write_at(0, &meta.encode()).await?;
    file.sync().await?;
    drop(file);
    storage.rename(&tmp, &path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SimulatedStorage;

    #[tokio::test]
    async fn test_store_and_load() {
        let storage = SimulatedStorage::new();
        let dir = Path::new("/data/ns/t/0");
        assert_eq!(load(&storage, dir).await.unwrap(), None);

        let meta = PrefixMeta {
            start_offset: Offset::new(500),
            term: Some(TermId::new(3)),
        };
        store(&storage, dir, meta).await.unwrap();
        assert_eq!(load(&storage, dir).await.unwrap(), Some(meta));
        assert!(!storage.exists(&dir.join("prefix.meta.tmp")).await.unwrap());
    }

    #[tokio::test]
    async fn test_damaged_file_is_rejected() {
        let storage = SimulatedStorage::new();
        let dir = Path::new("/data/ns/t/0");
        store(
            &storage,
            dir,
            PrefixMeta {
                start_offset: Offset::new(1),
                term: None,
            },
        )
        .await
        .unwrap();
        storage.corrupt_bytes(&dir.join(PREFIX_FILE_NAME), 8, 1);
        let err = load(&storage, dir).await.unwrap_err();
        assert!(err.is_corruption());
    }
}
