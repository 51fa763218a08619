//! Node-wide log registry.
//!
//! The [`LogManager`] maps NTPs to open logs, recovering each on first use,
//! and runs a background task that flushes and compacts every log.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use keel_core::{Ntp, Timestamp};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{CompactionConfig, LogConfig, LogManagerConfig};
use crate::error::{StorageError, StorageResult};
use crate::log::Log;
use crate::storage::Storage;

/// A log that is open, or being recovered by the first caller to need it.
type LogSlot = Arc<OnceCell<Arc<Log>>>;

type LogMap = Arc<Mutex<HashMap<Ntp, LogSlot>>>;

fn open_logs(logs: &HashMap<Ntp, LogSlot>) -> Vec<Arc<Log>> {
    logs.values().filter_map(|slot| slot.get().cloned()).collect()
}

/// Owns every log on a node.
pub struct LogManager {
    config: LogManagerConfig,
    storage: Arc<dyn Storage>,
    logs: LogMap,
    housekeeping: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("base_dir", &self.config.base_dir)
            .finish_non_exhaustive()
    }
}

impl LogManager {
    /// Creates a manager storing logs under `config.base_dir`.
    ///
    /// # Errors
    /// Returns an error if the default log configuration is invalid.
    pub fn new(config: LogManagerConfig, storage: Arc<dyn Storage>) -> StorageResult<Self> {
        config
            .default_log_config
            .validate()
            .map_err(|reason| StorageError::InvalidConfig { reason })?;
        Ok(Self {
            config,
            storage,
            logs: Arc::new(Mutex::new(HashMap::new())),
            housekeeping: std::sync::Mutex::new(None),
        })
    }

    /// The manager's configuration.
    #[must_use]
    pub const fn config(&self) -> &LogManagerConfig {
        &self.config
    }

    /// Returns the log for `ntp`, opening and recovering it if needed.
    ///
    /// Concurrent calls for the same NTP yield the same log. Recovery of one
    /// NTP does not block calls for others.
    ///
    /// # Errors
    /// Returns an error if recovery fails.
    pub async fn manage(&self, ntp: Ntp) -> StorageResult<Arc<Log>> {
        self.manage_with(ntp, self.config.default_log_config.clone())
            .await
    }

    /// Like [`LogManager::manage`] with an explicit configuration. The
    /// configuration is ignored if the log is already open.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or recovery fails.
    pub async fn manage_with(&self, ntp: Ntp, config: LogConfig) -> StorageResult<Arc<Log>> {
        let slot = Arc::clone(self.logs.lock().await.entry(ntp.clone()).or_default());
        let dir = self.config.base_dir.join(ntp.path());
        let (open_ntp, storage) = (ntp.clone(), Arc::clone(&self.storage));
        let opened = slot
            .get_or_try_init(move || async move {
                Log::open(open_ntp, dir, storage, config).await.map(Arc::new)
            })
            .await;
        match opened {
            Ok(log) => Ok(Arc::clone(log)),
            Err(e) => {
                // Drop the empty slot so a later call retries recovery.
                let mut logs = self.logs.lock().await;
                if logs
                    .get(&ntp)
                    .is_some_and(|s| Arc::ptr_eq(s, &slot) && s.get().is_none())
                {
                    logs.remove(&ntp);
                }
                Err(e)
            }
        }
    }

    /// Returns the open log for `ntp`.
    pub async fn get(&self, ntp: &Ntp) -> Option<Arc<Log>> {
        self.logs.lock().await.get(ntp)?.get().cloned()
    }

    /// Every open log.
    pub async fn logs(&self) -> Vec<Arc<Log>> {
        open_logs(&*self.logs.lock().await)
    }

    /// Closes the log for `ntp` and deletes its directory.
    ///
    /// # Errors
    /// Returns an error if closing or deleting fails.
    pub async fn remove(&self, ntp: &Ntp) -> StorageResult<()> {
        let Some(log) = self
            .logs
            .lock()
            .await
            .remove(ntp)
            .and_then(|slot| slot.get().cloned())
        else {
            return Ok(());
        };
        log.close().await?;
        self.storage.remove_dir_all(log.dir()).await?;
        info!(%ntp, "log removed");
        Ok(())
    }

    /// Starts the background flush and compaction task.
    ///
    /// Each tick flushes every log and then compacts it up to its committed
    /// offset. Failures are logged and retried on the next tick.
    pub fn spawn_housekeeping(&self) {
        let logs = Arc::clone(&self.logs);
        let interval = self.config.housekeeping_interval;
        let handle = tokio::spawn(housekeeping_loop(logs, interval));
        let mut slot = self
            .housekeeping
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Stops housekeeping and closes every log.
    ///
    /// All logs are closed even if some fail.
    ///
    /// # Errors
    /// Returns [`StorageError::Multiple`] holding every close failure.
    pub async fn stop(&self) -> StorageResult<()> {
        let handle = self
            .housekeeping
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        let logs: Vec<_> = self
            .logs
            .lock()
            .await
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect();
        let count = logs.len();
        let errors: Vec<_> = join_all(logs.iter().map(|log| log.close()))
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        info!(logs = count, failed = errors.len(), "log manager stopped");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StorageError::Multiple(errors))
        }
    }
}

async fn housekeeping_loop(logs: LogMap, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let snapshot = open_logs(&*logs.lock().await);
        for log in snapshot {
            if log.is_closed().await {
                continue;
            }
            if let Err(e) = log.flush().await {
                warn!(ntp = %log.ntp(), error = %e, "housekeeping flush failed");
                continue;
            }
            let committed = log.offsets().await.committed_offset;
            let config = CompactionConfig::from_log_config(log.config(), committed, Timestamp::now());
            match log.compact(config).await {
                Ok(stats) => debug!(ntp = %log.ntp(), ?stats, "housekeeping pass"),
                Err(e) => warn!(ntp = %log.ntp(), error = %e, "housekeeping compaction failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CleanupPolicy;
    use crate::log::AppendConfig;
    use crate::reader::ReaderConfig;
    use crate::storage::{SimulatedStorage, StorageFile, TokioStorage};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use tokio::sync::{Notify, Semaphore};
    use keel_core::{BatchType, IoBuf, Offset, RecordBatchBuilder, TermId};

    fn batch(key: &str) -> keel_core::RecordBatch {
        RecordBatchBuilder::new(BatchType::RaftData)
            .add_record(Some(IoBuf::from(key)), "payload")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_manage_is_idempotent() {
        let manager = LogManager::new(
            LogManagerConfig::new("/data"),
            Arc::new(SimulatedStorage::new()),
        )
        .unwrap();
        let ntp = Ntp::new("kafka", "orders", 3);
        let (a, b) = tokio::join!(manager.manage(ntp.clone()), manager.manage(ntp.clone()));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(manager.logs().await.len(), 1);
        assert!(manager.get(&ntp).await.is_some());
    }

    /// Holds directory listings of one directory until released.
    #[derive(Debug)]
    struct GatedStorage {
        inner: SimulatedStorage,
        gated: PathBuf,
        reached: Notify,
        gate: Semaphore,
    }

    #[async_trait]
    impl Storage for GatedStorage {
        async fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageFile>> {
            self.inner.open(path).await
        }

        async fn exists(&self, path: &Path) -> StorageResult<bool> {
            self.inner.exists(path).await
        }

        async fn list_files(&self, dir: &Path) -> StorageResult<Vec<PathBuf>> {
            if dir == self.gated {
                self.reached.notify_one();
                let _permit = self.gate.acquire().await.unwrap();
            }
            self.inner.list_files(dir).await
        }

        async fn remove(&self, path: &Path) -> StorageResult<()> {
            self.inner.remove(path).await
        }

        async fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
            self.inner.rename(from, to).await
        }

        async fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
            self.inner.create_dir_all(path).await
        }

        async fn remove_dir_all(&self, path: &Path) -> StorageResult<()> {
            self.inner.remove_dir_all(path).await
        }
    }

    #[tokio::test]
    async fn test_slow_recovery_does_not_block_other_logs() {
        let slow = Ntp::new("kafka", "slow", 0);
        let fast = Ntp::new("kafka", "fast", 0);
        let storage = Arc::new(GatedStorage {
            inner: SimulatedStorage::new(),
            gated: Path::new("/data").join(slow.path()),
            reached: Notify::new(),
            gate: Semaphore::new(0),
        });
        let manager = Arc::new(
            LogManager::new(LogManagerConfig::new("/data"), Arc::clone(&storage) as Arc<dyn Storage>)
                .unwrap(),
        );

        let opening = tokio::spawn({
            let manager = Arc::clone(&manager);
            let slow = slow.clone();
            async move { manager.manage(slow).await }
        });
        storage.reached.notified().await;

        let fast_log = tokio::time::timeout(Duration::from_secs(5), manager.manage(fast.clone()))
            .await
            .expect("other NTPs open while one recovers")
            .unwrap();
        assert_eq!(fast_log.ntp(), &fast);
        assert!(manager.get(&slow).await.is_none());
        assert_eq!(manager.logs().await.len(), 1);

        storage.gate.add_permits(1);
        let slow_log = opening.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&slow_log, &manager.get(&slow).await.unwrap()));
        assert_eq!(manager.logs().await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_recovery_is_retried() {
        let storage = SimulatedStorage::new();
        let manager =
            LogManager::new(LogManagerConfig::new("/data"), Arc::new(storage.clone())).unwrap();
        let ntp = Ntp::new("kafka", "orders", 0);
        let bad = LogConfig::new().with_max_segment_bytes(1);
        assert!(manager.manage_with(ntp.clone(), bad).await.is_err());
        assert!(manager.get(&ntp).await.is_none());
        assert!(manager.manage(ntp.clone()).await.is_ok());
        assert!(manager.get(&ntp).await.is_some());
    }

    #[tokio::test]
    async fn test_logs_survive_restart_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let ntp = Ntp::new("kafka", "orders", 0);
        {
            let manager =
                LogManager::new(LogManagerConfig::new(dir.path()), Arc::new(TokioStorage::new()))
                    .unwrap();
            let log = manager.manage(ntp.clone()).await.unwrap();
            log.append(vec![batch("a"), batch("b")], AppendConfig::assign(TermId::new(2)))
                .await
                .unwrap();
            manager.stop().await.unwrap();
        }
        assert!(dir.path().join("kafka/orders/0/0-2-v1.log").exists());

        let manager =
            LogManager::new(LogManagerConfig::new(dir.path()), Arc::new(TokioStorage::new()))
                .unwrap();
        let log = manager.manage(ntp).await.unwrap();
        let offsets = log.offsets().await;
        assert_eq!(offsets.dirty_offset, Some(Offset::new(1)));
        assert_eq!(offsets.last_term, Some(TermId::new(2)));
        let read = log.read(ReaderConfig::new(Offset::ZERO)).await.unwrap();
        assert_eq!(read.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_deletes_directory() {
        let storage = SimulatedStorage::new();
        let manager =
            LogManager::new(LogManagerConfig::new("/data"), Arc::new(storage.clone())).unwrap();
        let ntp = Ntp::new("kafka", "orders", 1);
        let log = manager.manage(ntp.clone()).await.unwrap();
        log.append(vec![batch("a")], AppendConfig::assign(TermId::new(1)))
            .await
            .unwrap();
        log.flush().await.unwrap();
        assert!(!storage.paths().is_empty());

        manager.remove(&ntp).await.unwrap();
        assert!(storage.paths().is_empty());
        assert!(manager.get(&ntp).await.is_none());
        assert!(log.is_closed().await);
    }

    #[tokio::test]
    async fn test_stop_reports_every_failure() {
        let storage = SimulatedStorage::new();
        let manager =
            LogManager::new(LogManagerConfig::new("/data"), Arc::new(storage.clone())).unwrap();
        for p in 0..3 {
            let log = manager.manage(Ntp::new("kafka", "orders", p)).await.unwrap();
            log.append(vec![batch("a")], AppendConfig::assign(TermId::new(1)))
                .await
                .unwrap();
        }
        storage.faults().fail_writes_after = Some(0);
        let err = manager.stop().await.unwrap_err();
        assert!(matches!(err, StorageError::Multiple(ref errors) if errors.len() == 3));
    }

    #[tokio::test]
    async fn test_invalid_default_config_rejected() {
        let config = LogManagerConfig::new("/data")
            .with_default_log_config(LogConfig::new().with_max_segment_bytes(1));
        assert!(LogManager::new(config, Arc::new(SimulatedStorage::new())).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_housekeeping_flushes_and_compacts() {
        let storage = SimulatedStorage::new();
        let config = LogManagerConfig::new("/data")
            .with_housekeeping_interval(Duration::from_secs(1))
            .with_default_log_config(
                LogConfig::new()
                    .with_cleanup_policy(CleanupPolicy::Compact)
                    .with_max_segment_bytes(1024),
            );
        let manager = LogManager::new(config, Arc::new(storage.clone())).unwrap();
        let log = manager.manage(Ntp::new("kafka", "orders", 0)).await.unwrap();
        for term in 1..=3 {
            log.append(vec![batch("same-key")], AppendConfig::assign(TermId::new(term)))
                .await
                .unwrap();
        }
        log.set_committed_offset(Offset::new(2)).await;
        manager.spawn_housekeeping();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let read = log.read(ReaderConfig::new(Offset::ZERO)).await.unwrap();
        let bases: Vec<u64> = read.iter().map(|b| b.base_offset().get()).collect();
        assert_eq!(bases, vec![1, 2]);
        assert_eq!(
            log.offsets().await.committed_offset,
            Some(Offset::new(2))
        );
        manager.stop().await.unwrap();
    }
}
