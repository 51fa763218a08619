//! Storage backends for segment files.
//!
//! The log never touches the filesystem directly: every file operation goes
//! through [`Storage`] and [`StorageFile`]. [`TokioStorage`] is the
//! production backend; [`SimulatedStorage`] keeps files in memory and can
//! inject torn writes, fsync failures and full disks for recovery testing.
//!
//! The traits handle raw bytes at positions. Batches, checksums and indexes
//! live one layer up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{StorageError, StorageResult};

/// Filesystem operations the log needs.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Opens a file for read/write, creating it if missing.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or created.
    async fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageFile>>;

    /// Checks if a file or directory exists.
    async fn exists(&self, path: &Path) -> StorageResult<bool>;

    /// Lists the regular files directly inside `dir`, sorted by path.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read.
    async fn list_files(&self, dir: &Path) -> StorageResult<Vec<PathBuf>>;

    /// Removes a file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be removed.
    async fn remove(&self, path: &Path) -> StorageResult<()>;

    /// Atomically renames `from` to `to`, replacing `to` if present.
    ///
    /// # Errors
    /// Returns an error if the rename fails.
    async fn rename(&self, from: &Path, to: &Path) -> StorageResult<()>;

    /// Creates a directory and all parent directories.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    async fn create_dir_all(&self, path: &Path) -> StorageResult<()>;

    /// Removes a directory and everything below it.
    ///
    /// # Errors
    /// Returns an error if removal fails.
    async fn remove_dir_all(&self, path: &Path) -> StorageResult<()>;
}

/// A handle to an open file.
#[async_trait]
pub trait StorageFile: Send + Sync {
    /// Writes data at the specified position.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    async fn write_at(&self, position: u64, data: &[u8]) -> StorageResult<()>;

    /// Reads up to `len` bytes from `position`. Short at end of file.
    ///
    /// # Errors
    /// Returns an error if the read fails.
    async fn read_at(&self, position: u64, len: usize) -> StorageResult<Bytes>;

    /// Reads the entire file.
    ///
    /// # Errors
    /// Returns an error if the read fails.
    async fn read_all(&self) -> StorageResult<Bytes>;

    /// Flushes written data to stable storage.
    ///
    /// # Errors
    /// Returns an error if the sync fails.
    async fn sync(&self) -> StorageResult<()>;

    /// Returns the file size in bytes.
    ///
    /// # Errors
    /// Returns an error if the size cannot be determined.
    async fn size(&self) -> StorageResult<u64>;

    /// Truncates the file to `len` bytes.
    ///
    /// # Errors
    /// Returns an error if the truncation fails.
    async fn truncate(&self, len: u64) -> StorageResult<()>;
}

// ----------------------------------------------------------------------------
// Tokio backend
// ----------------------------------------------------------------------------

/// File storage on `tokio::fs`.
///
/// `tokio::fs` runs blocking syscalls on the blocking pool, so this is async
/// at the API level only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioStorage;

impl TokioStorage {
    /// Creates a new Tokio storage instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Storage for TokioStorage {
    async fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageFile>> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await
            .map_err(|e| StorageError::io("open", e))?;
        Ok(Box::new(TokioFile {
            file: tokio::sync::Mutex::new(file),
        }))
    }

    async fn exists(&self, path: &Path) -> StorageResult<bool> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| StorageError::io("exists", e))
    }

    async fn list_files(&self, dir: &Path) -> StorageResult<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| StorageError::io("read_dir", e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io("read_dir_entry", e))?
        {
            let kind = entry
                .file_type()
                .await
                .map_err(|e| StorageError::io("file_type", e))?;
            if kind.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    async fn remove(&self, path: &Path) -> StorageResult<()> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| StorageError::io("remove", e))
    }

    async fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| StorageError::io("rename", e))
    }

    async fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| StorageError::io("create_dir_all", e))
    }

    async fn remove_dir_all(&self, path: &Path) -> StorageResult<()> {
        tokio::fs::remove_dir_all(path)
            .await
            .map_err(|e| StorageError::io("remove_dir_all", e))
    }
}

/// A file handle on `tokio::fs`. The mutex keeps seek+io pairs atomic.
struct TokioFile {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

#[async_trait]
#[allow(clippy::significant_drop_tightening)] // The lock must span seek and io.
impl StorageFile for TokioFile {
    async fn write_at(&self, position: u64, data: &[u8]) -> StorageResult<()> {
        use tokio::io::{AsyncSeekExt, AsyncWriteExt};

        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(position))
            .await
            .map_err(|e| StorageError::io("seek", e))?;
        file.write_all(data)
            .await
            .map_err(|e| StorageError::io("write", e))
    }

    async fn read_at(&self, position: u64, len: usize) -> StorageResult<Bytes> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(position))
            .await
            .map_err(|e| StorageError::io("seek", e))?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| StorageError::io("read", e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    async fn read_all(&self) -> StorageResult<Bytes> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(0))
            .await
            .map_err(|e| StorageError::io("seek", e))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| StorageError::io("read", e))?;
        Ok(Bytes::from(buf))
    }

    async fn sync(&self) -> StorageResult<()> {
        let file = self.file.lock().await;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io("sync", e))
    }

    async fn size(&self) -> StorageResult<u64> {
        let file = self.file.lock().await;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| StorageError::io("metadata", e))?;
        Ok(metadata.len())
    }

    async fn truncate(&self, len: u64) -> StorageResult<()> {
        let file = self.file.lock().await;
        file.set_len(len)
            .await
            .map_err(|e| StorageError::io("truncate", e))
    }
}

// ----------------------------------------------------------------------------
// Simulated backend
// ----------------------------------------------------------------------------

/// Faults the simulated backend can inject.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// The next write keeps only this many bytes and drops the rest, as if
    /// the process died mid-write.
    pub force_torn_write_at: Option<usize>,
    /// The next fsync fails.
    pub force_fsync_fail: bool,
    /// The next write fails with disk full.
    pub force_disk_full: bool,
    /// Every write fails once this many writes have succeeded.
    pub fail_writes_after: Option<u64>,
}

impl FaultConfig {
    /// No faults.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Tears the next write after `keep` bytes.
    #[must_use]
    pub const fn with_torn_write_at(mut self, keep: usize) -> Self {
        self.force_torn_write_at = Some(keep);
        self
    }

    /// Fails the next fsync.
    #[must_use]
    pub const fn with_fsync_fail(mut self) -> Self {
        self.force_fsync_fail = true;
        self
    }

    /// Fails the next write with disk full.
    #[must_use]
    pub const fn with_disk_full(mut self) -> Self {
        self.force_disk_full = true;
        self
    }

    /// Fails every write after `count` successful ones.
    #[must_use]
    pub const fn with_fail_writes_after(mut self, count: u64) -> Self {
        self.fail_writes_after = Some(count);
        self
    }
}

type FileMap = Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>;

/// In-memory storage for deterministic tests.
///
/// Clones share the same files, so a test can keep a handle, "crash" the
/// component under test by dropping it, damage the bytes, and reopen.
///
/// # Panics
///
/// Methods panic if an internal mutex is poisoned, which only happens after
/// another panic in a critical section.
#[derive(Debug, Clone, Default)]
#[allow(clippy::missing_panics_doc)]
pub struct SimulatedStorage {
    files: FileMap,
    faults: Arc<Mutex<FaultConfig>>,
    writes: Arc<AtomicU64>,
}

#[allow(clippy::missing_panics_doc)]
impl SimulatedStorage {
    /// Creates an empty simulated filesystem.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty simulated filesystem with faults armed.
    #[must_use]
    pub fn with_faults(faults: FaultConfig) -> Self {
        let storage = Self::default();
        *storage.faults() = faults;
        storage
    }

    /// Gives mutable access to the fault configuration.
    ///
    /// # Panics
    /// Panics if the lock is poisoned.
    pub fn faults(&self) -> MutexGuard<'_, FaultConfig> {
        self.faults.lock().expect("fault config lock poisoned")
    }

    /// Returns a copy of a file's bytes.
    #[must_use]
    pub fn raw_content(&self, path: &Path) -> Option<Vec<u8>> {
        self.lock_files().get(path).cloned()
    }

    /// Overwrites a file's bytes.
    pub fn set_raw_content(&self, path: &Path, content: Vec<u8>) {
        self.lock_files().insert(path.to_path_buf(), content);
    }

    /// Flips every bit of `len` bytes at `position`.
    pub fn corrupt_bytes(&self, path: &Path, position: usize, len: usize) {
        if let Some(content) = self.lock_files().get_mut(path) {
            let end = (position + len).min(content.len());
            for byte in content.iter_mut().take(end).skip(position) {
                *byte ^= 0xFF;
            }
        }
    }

    /// Cuts a file to `len` bytes.
    pub fn truncate_file(&self, path: &Path, len: usize) {
        if let Some(content) = self.lock_files().get_mut(path) {
            content.truncate(len);
        }
    }

    /// Lists every file path, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.lock_files().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn lock_files(&self) -> MutexGuard<'_, HashMap<PathBuf, Vec<u8>>> {
        self.files.lock().expect("files lock poisoned")
    }
}

#[async_trait]
impl Storage for SimulatedStorage {
    async fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageFile>> {
        self.lock_files().entry(path.to_path_buf()).or_default();
        Ok(Box::new(SimulatedFile {
            path: path.to_path_buf(),
            storage: self.clone(),
        }))
    }

    async fn exists(&self, path: &Path) -> StorageResult<bool> {
        let files = self.lock_files();
        Ok(files.contains_key(path) || files.keys().any(|p| p.starts_with(path)))
    }

    async fn list_files(&self, dir: &Path) -> StorageResult<Vec<PathBuf>> {
        let mut files: Vec<_> = self
            .lock_files()
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect();
        files.sort();
        Ok(files)
    }

    async fn remove(&self, path: &Path) -> StorageResult<()> {
        self.lock_files()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::io("remove", format!("{} not found", path.display())))
    }

    async fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        let mut files = self.lock_files();
        let content = files
            .remove(from)
            .ok_or_else(|| StorageError::io("rename", format!("{} not found", from.display())))?;
        files.insert(to.to_path_buf(), content);
        Ok(())
    }

    async fn create_dir_all(&self, _path: &Path) -> StorageResult<()> {
        // Directories are implicit.
        Ok(())
    }

    async fn remove_dir_all(&self, path: &Path) -> StorageResult<()> {
        self.lock_files().retain(|p, _| !p.starts_with(path));
        Ok(())
    }
}

struct SimulatedFile {
    path: PathBuf,
    storage: SimulatedStorage,
}

impl SimulatedFile {
    fn missing(&self, operation: &'static str) -> StorageError {
        StorageError::io(operation, format!("{} not found", self.path.display()))
    }
}

#[async_trait]
#[allow(clippy::cast_possible_truncation)] // In-memory files are far below usize::MAX.
impl StorageFile for SimulatedFile {
    async fn write_at(&self, position: u64, data: &[u8]) -> StorageResult<()> {
        let torn_at = {
            let mut faults = self.storage.faults();
            if faults.force_disk_full {
                faults.force_disk_full = false;
                return Err(StorageError::io("write", "disk full (simulated)"));
            }
            if let Some(limit) = faults.fail_writes_after {
                if self.storage.writes.load(Ordering::Relaxed) >= limit {
                    return Err(StorageError::io("write", "device gone (simulated)"));
                }
            }
            faults.force_torn_write_at.take()
        };
        self.storage.writes.fetch_add(1, Ordering::Relaxed);

        let mut files = self.storage.lock_files();
        let content = files.entry(self.path.clone()).or_default();
        let start = position as usize;
        let keep = torn_at.map_or(data.len(), |n| n.min(data.len()));
        if content.len() < start + keep {
            content.resize(start + keep, 0);
        }
        content[start..start + keep].copy_from_slice(&data[..keep]);
        if torn_at.is_some() {
            content.truncate(start + keep);
        }
        Ok(())
    }

    async fn read_at(&self, position: u64, len: usize) -> StorageResult<Bytes> {
        let files = self.storage.lock_files();
        let content = files.get(&self.path).ok_or_else(|| self.missing("read"))?;
        let start = (position as usize).min(content.len());
        let end = start.saturating_add(len).min(content.len());
        Ok(Bytes::copy_from_slice(&content[start..end]))
    }

    async fn read_all(&self) -> StorageResult<Bytes> {
        let files = self.storage.lock_files();
        let content = files.get(&self.path).ok_or_else(|| self.missing("read"))?;
        Ok(Bytes::copy_from_slice(content))
    }

    async fn sync(&self) -> StorageResult<()> {
        let mut faults = self.storage.faults();
        if faults.force_fsync_fail {
            faults.force_fsync_fail = false;
            return Err(StorageError::io("sync", "fsync failed (simulated)"));
        }
        Ok(())
    }

    async fn size(&self) -> StorageResult<u64> {
        let files = self.storage.lock_files();
        let content = files.get(&self.path).ok_or_else(|| self.missing("size"))?;
        Ok(content.len() as u64)
    }

    async fn truncate(&self, len: u64) -> StorageResult<()> {
        let mut files = self.storage.lock_files();
        let content = files.get_mut(&self.path).ok_or_else(|| self.missing("truncate"))?;
        content.resize(len as usize, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_storage_write_read() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("0-1-v1.log");

        let storage = TokioStorage::new();
        let file = storage.open(&path).await.unwrap();
        file.write_at(0, b"hello, world!").await.unwrap();
        file.sync().await.unwrap();

        assert_eq!(&file.read_at(7, 5).await.unwrap()[..], b"world");
        assert_eq!(file.size().await.unwrap(), 13);
        assert_eq!(&file.read_at(10, 100).await.unwrap()[..], b"ld!");

        file.truncate(5).await.unwrap();
        assert_eq!(&file.read_all().await.unwrap()[..], b"hello");
    }

    #[tokio::test]
    async fn test_tokio_storage_directory_ops() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().join("kafka/orders/0");
        let storage = TokioStorage::new();
        storage.create_dir_all(&dir).await.unwrap();
        assert!(storage.exists(&dir).await.unwrap());

        let _ = storage.open(&dir.join("b.log")).await.unwrap();
        let _ = storage.open(&dir.join("a.log")).await.unwrap();
        storage.create_dir_all(&dir.join("nested")).await.unwrap();

        let files = storage.list_files(&dir).await.unwrap();
        assert_eq!(files, vec![dir.join("a.log"), dir.join("b.log")]);

        storage
            .rename(&dir.join("a.log"), &dir.join("a.log.cannotrecover"))
            .await
            .unwrap();
        assert!(!storage.exists(&dir.join("a.log")).await.unwrap());

        storage.remove_dir_all(&dir).await.unwrap();
        assert!(!storage.exists(&dir).await.unwrap());
    }

    #[tokio::test]
    async fn test_simulated_storage_basic_operations() {
        let storage = SimulatedStorage::new();
        let path = Path::new("/data/kafka/t/0/0-1-v1.log");

        assert!(!storage.exists(path).await.unwrap());
        let file = storage.open(path).await.unwrap();
        assert!(storage.exists(path).await.unwrap());
        assert!(storage.exists(Path::new("/data/kafka/t/0")).await.unwrap());

        file.write_at(0, b"hello").await.unwrap();
        file.write_at(5, b" world").await.unwrap();
        assert_eq!(&file.read_all().await.unwrap()[..], b"hello world");
        assert_eq!(file.size().await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_simulated_storage_torn_write() {
        let storage = SimulatedStorage::with_faults(FaultConfig::none().with_torn_write_at(5));
        let path = Path::new("/t/torn.log");
        let file = storage.open(path).await.unwrap();

        file.write_at(0, b"0123456789").await.unwrap();
        assert_eq!(storage.raw_content(path).unwrap(), b"01234");

        // Fault is one-shot.
        file.write_at(5, b"56789").await.unwrap();
        assert_eq!(storage.raw_content(path).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_simulated_storage_fsync_and_disk_full() {
        let storage = SimulatedStorage::with_faults(
            FaultConfig::none().with_fsync_fail().with_disk_full(),
        );
        let file = storage.open(Path::new("/t/f.log")).await.unwrap();

        assert!(file.write_at(0, b"data").await.is_err());
        assert!(file.write_at(0, b"data").await.is_ok());
        assert!(file.sync().await.is_err());
        assert!(file.sync().await.is_ok());
    }

    #[tokio::test]
    async fn test_simulated_storage_fail_writes_after() {
        let storage =
            SimulatedStorage::with_faults(FaultConfig::none().with_fail_writes_after(2));
        let file = storage.open(Path::new("/t/f.log")).await.unwrap();
        file.write_at(0, b"a").await.unwrap();
        file.write_at(1, b"b").await.unwrap();
        assert!(file.write_at(2, b"c").await.is_err());
    }

    #[tokio::test]
    async fn test_simulated_storage_rename_and_list() {
        let storage = SimulatedStorage::new();
        let dir = Path::new("/d");
        for name in ["2-1-v1.log", "0-1-v1.log", "junk.txt"] {
            let _ = storage.open(&dir.join(name)).await.unwrap();
        }
        let _ = storage.open(Path::new("/d/sub/x.log")).await.unwrap();

        let files = storage.list_files(dir).await.unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[0], dir.join("0-1-v1.log"));

        storage
            .rename(&dir.join("junk.txt"), &dir.join("junk.old"))
            .await
            .unwrap();
        assert!(storage.raw_content(&dir.join("junk.old")).is_some());
        assert!(storage.rename(&dir.join("nope"), &dir.join("x")).await.is_err());

        storage.remove_dir_all(dir).await.unwrap();
        assert!(storage.paths().is_empty());
    }

    #[tokio::test]
    async fn test_simulated_storage_clone_shares_state() {
        let storage = SimulatedStorage::new();
        let path = Path::new("/t/shared.log");
        let file = storage.open(path).await.unwrap();
        file.write_at(0, b"original").await.unwrap();

        let other = storage.clone();
        other.corrupt_bytes(path, 0, 1);
        assert_ne!(storage.raw_content(path).unwrap()[0], b'o');
    }
}
