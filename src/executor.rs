//! Serialized commit application.
//!
//! All committed batches flow through one queue consumed by one worker task,
//! so storage sees them in exactly the order their commit timestamps were
//! allocated. The oracle's commit lock is held across timestamp allocation
//! and [`CommitExecutor::submit`], which makes queue order and timestamp
//! order identical without the worker ever reordering.
//!
//! The worker applies each batch to the storage view, marks the commit
//! applied on the oracle, and acks the waiting transaction. When the frozen
//! memtable queue is full it pauses until the flush task catches up.

use crate::batch::TimestampedBatch;
use crate::error::{Error, Result};
use crate::oracle::Oracle;
use crate::view::StorageView;

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

struct Job {
    batch: TimestampedBatch,
    ack: oneshot::Sender<Result<()>>,
}

pub struct CommitExecutor {
    tx: RwLock<Option<mpsc::UnboundedSender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CommitExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitExecutor").finish()
    }
}

impl CommitExecutor {
    /// Spawn the apply worker. Must be called inside a tokio runtime.
    pub fn new(view: Arc<StorageView>, oracle: Arc<Oracle>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(view, oracle, rx));
        Self {
            tx: RwLock::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a stamped batch. The returned receiver resolves once the
    /// batch is durable in the active memtable's WAL.
    ///
    /// The send is synchronous, so the caller may hold the oracle's commit
    /// lock across it without blocking the runtime.
    pub fn submit(&self, batch: TimestampedBatch) -> Result<oneshot::Receiver<Result<()>>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let tx = self
            .tx
            .read()
            .map_err(|_| Error::InvalidState("executor lock poisoned".to_string()))?;
        let tx = tx.as_ref().ok_or(Error::EngineStopped)?;
        tx.send(Job {
            batch,
            ack: ack_tx,
        })
        .map_err(|_| Error::EngineStopped)?;
        Ok(ack_rx)
    }

    /// Close the queue and wait for the worker to drain every pending batch.
    pub async fn stop(&self) {
        if let Ok(mut tx) = self.tx.write() {
            tx.take();
        }
        let handle = match self.handle.lock() {
            Ok(mut handle) => handle.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run(
    view: Arc<StorageView>,
    oracle: Arc<Oracle>,
    mut rx: mpsc::UnboundedReceiver<Job>,
) {
    while let Some(job) = rx.recv().await {
        while view.frozen_count() >= view.config().max_frozen_memtables {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let commit_ts = job.batch.commit_ts();
        let result = view.apply_batch(&job.batch);
        if let Err(e) = &result {
            tracing::error!(commit_ts, error = %e, "failed to apply committed batch");
        }
        oracle.done_commit(commit_ts);
        let _ = job.ack.send(result);
    }
    tracing::trace!("commit executor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Batch;
    use crate::config::Config;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir) -> (Arc<StorageView>, Arc<Oracle>, CommitExecutor) {
        let config = Arc::new(Config::new(dir.path()));
        let (view, last_ts) = StorageView::open(config).unwrap();
        let view = Arc::new(view);
        let oracle = Arc::new(Oracle::new(last_ts));
        let executor = CommitExecutor::new(Arc::clone(&view), Arc::clone(&oracle));
        (view, oracle, executor)
    }

    #[tokio::test]
    async fn test_submitted_batches_apply_in_order() {
        let dir = TempDir::new().unwrap();
        let (view, _, executor) = setup(&dir).await;

        for ts in 1..=3u64 {
            let mut batch = Batch::new();
            batch
                .put(b"counter".to_vec(), format!("{}", ts).into_bytes())
                .unwrap();
            let ack = executor.submit(batch.stamp(ts)).unwrap();
            ack.await.unwrap().unwrap();
        }

        assert_eq!(view.get(b"counter", 10).unwrap(), Some(b"3".to_vec()));
        assert_eq!(view.get(b"counter", 2).unwrap(), Some(b"2".to_vec()));
        executor.stop().await;
    }

    #[tokio::test]
    async fn test_submit_after_stop_rejected() {
        let dir = TempDir::new().unwrap();
        let (_, _, executor) = setup(&dir).await;
        executor.stop().await;

        let mut batch = Batch::new();
        batch.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        assert!(matches!(
            executor.submit(batch.stamp(1)),
            Err(Error::EngineStopped)
        ));
    }

    #[tokio::test]
    async fn test_stop_drains_pending_batches() {
        let dir = TempDir::new().unwrap();
        let (view, _, executor) = setup(&dir).await;

        let mut acks = Vec::new();
        for ts in 1..=10u64 {
            let mut batch = Batch::new();
            batch
                .put(format!("key-{}", ts).into_bytes(), b"v".to_vec())
                .unwrap();
            acks.push(executor.submit(batch.stamp(ts)).unwrap());
        }
        executor.stop().await;

        for ack in acks {
            ack.await.unwrap().unwrap();
        }
        assert_eq!(view.get(b"key-10", 20).unwrap(), Some(b"v".to_vec()));
    }
}
