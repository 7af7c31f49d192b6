//! The storage engine facade.
//!
//! [`Engine::open`] recovers (or creates) the store, seeds the oracle's
//! clock from the highest persisted commit timestamp, starts the commit
//! executor, and registers the flush, compaction, and cleanup tasks on the
//! scheduler. All access goes through [`Engine::read`] and
//! [`Engine::write`], which scope a transaction to a closure so snapshot
//! release can never be forgotten.

use crate::cleanup::TableCleaner;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::CommitExecutor;
use crate::oracle::Oracle;
use crate::scheduler::Scheduler;
use crate::tasks::{CleanupTask, CompactionTask, FlushTask};
use crate::txn::{ReadTransaction, Transaction};
use crate::view::StorageView;

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub struct Engine {
    view: Arc<StorageView>,
    oracle: Arc<Oracle>,
    executor: CommitExecutor,
    cleaner: Arc<TableCleaner>,
    scheduler: Mutex<Option<Scheduler>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("view", &self.view)
            .finish()
    }
}

impl Engine {
    /// Open the store under `config.dir`, recovering any persisted state.
    /// Must be called inside a tokio runtime.
    pub async fn open(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let (view, last_commit_ts) = StorageView::open(Arc::clone(&config))?;
        let view = Arc::new(view);
        let oracle = Arc::new(Oracle::new(last_commit_ts));
        let executor = CommitExecutor::new(Arc::clone(&view), Arc::clone(&oracle));
        let cleaner = Arc::new(TableCleaner::new());

        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(FlushTask::new(Arc::clone(&view))));
        scheduler.register(Arc::new(CompactionTask::new(
            Arc::clone(&view),
            Arc::clone(&oracle),
            Arc::clone(&cleaner),
        )));
        scheduler.register(Arc::new(CleanupTask::new(
            Arc::clone(&view),
            Arc::clone(&cleaner),
        )));

        tracing::info!(dir = %config.dir.display(), last_commit_ts, "engine opened");
        Ok(Self {
            view,
            oracle,
            executor,
            cleaner,
            scheduler: Mutex::new(Some(scheduler)),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::EngineStopped);
        }
        Ok(())
    }

    /// Run a read-only closure against a consistent snapshot.
    pub async fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ReadTransaction) -> Result<R>,
    {
        self.ensure_open()?;
        let begin_ts = self.oracle.begin_timestamp().await?;
        let txn = ReadTransaction::new(begin_ts, Arc::clone(&self.view));
        let result = f(&txn);
        self.oracle.done_read(begin_ts);
        result
    }

    /// Run a read-write closure in a transaction and commit it. Returns
    /// [`Error::Conflict`] when a key read by the closure was overwritten by
    /// a transaction that committed concurrently.
    pub async fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction) -> Result<R>,
    {
        self.ensure_open()?;
        let begin_ts = self.oracle.begin_timestamp().await?;
        let mut txn = Transaction::new(begin_ts, Arc::clone(&self.view));

        let result = match f(&mut txn) {
            Ok(result) => result,
            Err(e) => {
                self.oracle.done_read(begin_ts);
                return Err(e);
            }
        };

        let commit = txn.commit(&self.oracle, &self.executor).await;
        self.oracle.done_read(begin_ts);
        commit?;
        Ok(result)
    }

    /// Point lookup at the latest snapshot.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read(|txn| txn.get(key)).await
    }

    /// Write one key.
    pub async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.write(move |txn| txn.set(key, value)).await
    }

    /// Delete one key.
    pub async fn delete(&self, key: Vec<u8>) -> Result<()> {
        self.write(move |txn| txn.delete(key)).await
    }

    /// Range scan at the latest snapshot.
    pub async fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.read(|txn| txn.scan(lower, upper)).await
    }

    /// Direct access to the storage view, for inspection and tests.
    pub fn view(&self) -> &Arc<StorageView> {
        &self.view
    }

    /// Stop background work, drain pending commits, and sync the WAL.
    /// Subsequent operations return [`Error::EngineStopped`].
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let scheduler = match self.scheduler.lock() {
            Ok(mut scheduler) => scheduler.take(),
            Err(_) => None,
        };
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await?;
        }

        self.executor.stop().await;
        self.oracle.close();
        self.view.sync()?;
        let _ = self.cleaner.reclaim();
        tracing::info!("engine closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompactionConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    fn small_config(dir: &TempDir) -> Config {
        Config::new(dir.path())
            .memtable_size_bytes(512)
            .sstable_size_bytes(2048)
            .flush_interval(Duration::from_millis(10))
            .compaction_interval(Duration::from_millis(20))
            .cleanup_interval(Duration::from_millis(20))
            .compaction(
                CompactionConfig::default()
                    .max_levels(3)
                    .level0_files_compaction_trigger(2),
            )
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(small_config(&dir)).await.unwrap();

        engine
            .put(b"consensus".to_vec(), b"raft".to_vec())
            .await
            .unwrap();
        assert_eq!(
            engine.get(b"consensus").await.unwrap(),
            Some(b"raft".to_vec())
        );

        engine.delete(b"consensus".to_vec()).await.unwrap();
        assert_eq!(engine.get(b"consensus").await.unwrap(), None);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_overwrites_resolve_to_newest() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(small_config(&dir)).await.unwrap();

        engine
            .put(b"consensus".to_vec(), b"raft".to_vec())
            .await
            .unwrap();
        engine
            .put(b"consensus".to_vec(), b"paxos".to_vec())
            .await
            .unwrap();

        assert_eq!(
            engine.get(b"consensus").await.unwrap(),
            Some(b"paxos".to_vec())
        );
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_transactional_read_modify_write() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(small_config(&dir)).await.unwrap();

        engine.put(b"counter".to_vec(), b"1".to_vec()).await.unwrap();
        engine
            .write(|txn| {
                let current = txn.get(b"counter")?.unwrap_or_default();
                let next = (String::from_utf8_lossy(&current).parse::<u64>().unwrap() + 1)
                    .to_string()
                    .into_bytes();
                txn.set(b"counter".to_vec(), next)
            })
            .await
            .unwrap();

        assert_eq!(engine.get(b"counter").await.unwrap(), Some(b"2".to_vec()));
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_spans_memtables_and_tables() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(small_config(&dir)).await.unwrap();

        // Enough data to force freezes and flushes through the tiny budget
        for i in 0..50u32 {
            engine
                .put(
                    format!("key-{:03}", i).into_bytes(),
                    format!("value-{}", i).into_bytes(),
                )
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let entries = engine
            .scan(Bound::Unbounded, Bound::Unbounded)
            .await
            .unwrap();
        assert_eq!(entries.len(), 50);
        assert_eq!(entries[0].0, b"key-000".to_vec());
        assert_eq!(entries[49].0, b"key-049".to_vec());

        let entries = engine
            .scan(Bound::Included(b"key-010"), Bound::Excluded(b"key-020"))
            .await
            .unwrap();
        assert_eq!(entries.len(), 10);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_background_compaction_keeps_reads_correct() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(small_config(&dir)).await.unwrap();

        for round in 0..4u32 {
            for i in 0..20u32 {
                engine
                    .put(
                        format!("key-{:03}", i).into_bytes(),
                        format!("round-{}", round).into_bytes(),
                    )
                    .await
                    .unwrap();
            }
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        for i in 0..20u32 {
            let value = engine
                .get(format!("key-{:03}", i).as_bytes())
                .await
                .unwrap();
            assert_eq!(value, Some(b"round-3".to_vec()));
        }
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_recovers_data() {
        let dir = TempDir::new().unwrap();

        {
            let engine = Engine::open(small_config(&dir)).await.unwrap();
            engine
                .put(b"durable".to_vec(), b"yes".to_vec())
                .await
                .unwrap();
            engine.delete(b"gone".to_vec()).await.unwrap();
            engine.close().await.unwrap();
        }

        let engine = Engine::open(small_config(&dir)).await.unwrap();
        assert_eq!(engine.get(b"durable").await.unwrap(), Some(b"yes".to_vec()));
        assert_eq!(engine.get(b"gone").await.unwrap(), None);

        // Timestamps keep ascending after recovery
        engine
            .put(b"durable".to_vec(), b"still".to_vec())
            .await
            .unwrap();
        assert_eq!(
            engine.get(b"durable").await.unwrap(),
            Some(b"still".to_vec())
        );
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_engine_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(small_config(&dir)).await.unwrap();
        engine.close().await.unwrap();

        assert!(matches!(
            engine.get(b"k").await,
            Err(Error::EngineStopped)
        ));
        assert!(matches!(
            engine.put(b"k".to_vec(), b"v".to_vec()).await,
            Err(Error::EngineStopped)
        ));
        // close is idempotent
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_write_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(small_config(&dir)).await.unwrap();
        let result = engine.write(|_txn| Ok(())).await;
        assert!(matches!(result, Err(Error::EmptyTransaction)));
        engine.close().await.unwrap();
    }
}
