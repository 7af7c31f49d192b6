//! Background maintenance tasks: flush, compaction, and file cleanup.

use crate::cleanup::TableCleaner;
use crate::compaction::{compact, SimpleLeveledPolicy};
use crate::error::Result;
use crate::oracle::Oracle;
use crate::scheduler::{BackgroundTask, Context};
use crate::view::StorageView;

use std::sync::Arc;
use std::time::Duration;

/// Flushes the oldest frozen memtable into level 0.
pub struct FlushTask {
    view: Arc<StorageView>,
}

impl FlushTask {
    pub fn new(view: Arc<StorageView>) -> Self {
        Self { view }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "flush"
    }

    fn interval(&self) -> Duration {
        self.view.config().flush_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        // Drain the whole frozen queue so backpressured writers unblock fast
        while self.view.force_flush_next_frozen()? {}
        Ok(())
    }
}

/// Runs one compaction round when the policy finds a level violation.
pub struct CompactionTask {
    view: Arc<StorageView>,
    oracle: Arc<Oracle>,
    cleaner: Arc<TableCleaner>,
    policy: SimpleLeveledPolicy,
}

impl CompactionTask {
    pub fn new(
        view: Arc<StorageView>,
        oracle: Arc<Oracle>,
        cleaner: Arc<TableCleaner>,
    ) -> Self {
        let policy = SimpleLeveledPolicy::new(view.config().compaction.clone());
        Self {
            view,
            oracle,
            cleaner,
            policy,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.view.config().compaction_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let snapshot = self.view.snapshot();
        let Some(job) = self.policy.pick(&snapshot) else {
            return Ok(());
        };
        drop(snapshot);

        let watermark = self.oracle.max_begin_timestamp();
        let change = compact(&self.view, &job, watermark)?;
        let superseded = self.view.apply_compaction(change)?;
        self.cleaner.submit(superseded)
    }
}

/// Deletes superseded table files once no reader references them.
pub struct CleanupTask {
    view: Arc<StorageView>,
    cleaner: Arc<TableCleaner>,
}

impl CleanupTask {
    pub fn new(view: Arc<StorageView>, cleaner: Arc<TableCleaner>) -> Self {
        Self { view, cleaner }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CleanupTask {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn interval(&self) -> Duration {
        self.view.config().cleanup_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.cleaner.reclaim()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Batch;
    use crate::config::{CompactionConfig, Config};
    use tempfile::TempDir;

    fn open_view(dir: &TempDir) -> Arc<StorageView> {
        let config = Arc::new(
            Config::new(dir.path()).compaction(
                CompactionConfig::default().level0_files_compaction_trigger(2),
            ),
        );
        Arc::new(StorageView::open(config).unwrap().0)
    }

    fn flush_batch(view: &StorageView, raw: &[u8], value: &[u8], ts: u64) {
        let mut batch = Batch::new();
        batch.put(raw.to_vec(), value.to_vec()).unwrap();
        view.apply_batch(&batch.stamp(ts)).unwrap();
        view.freeze_active().unwrap();
        view.force_flush_next_frozen().unwrap();
    }

    #[tokio::test]
    async fn test_compaction_task_merges_l0() {
        let dir = TempDir::new().unwrap();
        let view = open_view(&dir);
        let oracle = Arc::new(Oracle::new(0));
        let cleaner = Arc::new(TableCleaner::new());

        flush_batch(&view, b"bolt", b"v1", 1);
        flush_batch(&view, b"bolt", b"v2", 2);
        assert_eq!(view.snapshot().l0.len(), 2);

        let task = CompactionTask::new(
            Arc::clone(&view),
            Arc::clone(&oracle),
            Arc::clone(&cleaner),
        );
        let ctx = Context {
            task_name: "compaction",
            run_id: 1,
            shutdown: tokio::sync::broadcast::channel(1).1,
        };
        task.execute(ctx).await.unwrap();

        let snapshot = view.snapshot();
        assert!(snapshot.l0.is_empty());
        assert_eq!(snapshot.levels[0].len(), 1);
        assert_eq!(cleaner.pending_count(), 2);

        // No reader holds the old tables, so cleanup deletes them
        drop(snapshot);
        cleaner.reclaim().unwrap();
        assert_eq!(cleaner.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_task_drains_frozen_queue() {
        let dir = TempDir::new().unwrap();
        let view = open_view(&dir);

        for ts in 1..=3u64 {
            let mut batch = Batch::new();
            batch
                .put(format!("key-{}", ts).into_bytes(), b"v".to_vec())
                .unwrap();
            view.apply_batch(&batch.stamp(ts)).unwrap();
            view.freeze_active().unwrap();
        }
        assert_eq!(view.snapshot().frozen.len(), 3);

        let task = FlushTask::new(Arc::clone(&view));
        let ctx = Context {
            task_name: "flush",
            run_id: 1,
            shutdown: tokio::sync::broadcast::channel(1).1,
        };
        task.execute(ctx).await.unwrap();

        let snapshot = view.snapshot();
        assert!(snapshot.frozen.is_empty());
        assert_eq!(snapshot.l0.len(), 3);
    }
}
