//! Simple leveled compaction with MVCC garbage collection.
//!
//! The policy watches table counts. Level 0 compacts into level 1 once it
//! accumulates `level0_files_compaction_trigger` tables; below that, level N
//! compacts into level N+1 whenever `count(N+1) / count(N)` falls under the
//! configured percentage. A compaction always consumes the entire lower
//! level, so every level below 0 stays sorted and non-overlapping.
//!
//! While merging, versions shadowed below the begin watermark are dropped:
//! no live or future snapshot can reach them. For each raw key the newest
//! version at or below the watermark is kept unless it is a tombstone, in
//! which case the tombstone and everything older disappear.

use crate::config::CompactionConfig;
use crate::error::Result;
use crate::iterator::{EntryIter, MergeIterator};
use crate::key::is_tombstone;
use crate::sstable::SstBuilder;
use crate::state::{CompactionChange, StorageState};
use crate::view::StorageView;

/// A unit of compaction work: merge `upper_ids` and `lower_ids` into a fresh
/// `lower_level`. `upper_level` is -1 when the upper level is level 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionJob {
    pub upper_level: i32,
    pub upper_ids: Vec<u64>,
    pub lower_level: u32,
    pub lower_ids: Vec<u64>,
}

#[derive(Debug)]
pub struct SimpleLeveledPolicy {
    config: CompactionConfig,
}

impl SimpleLeveledPolicy {
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }

    /// Decide whether any level pair needs compacting. Checks top-down and
    /// returns the first violation found.
    pub fn pick(&self, snapshot: &StorageState) -> Option<CompactionJob> {
        let mut counts = Vec::with_capacity(self.config.max_levels + 1);
        counts.push(snapshot.l0.len());
        for level in &snapshot.levels {
            counts.push(level.len());
        }

        for upper in 0..self.config.max_levels {
            if upper == 0 {
                if counts[0] < self.config.level0_files_compaction_trigger {
                    continue;
                }
            } else if counts[upper] == 0 {
                continue;
            }

            let ratio = counts[upper + 1] * 100 / counts[upper];
            if ratio >= self.config.level_size_ratio_percentage {
                continue;
            }

            let lower = upper + 1;
            tracing::debug!(
                upper_level = upper,
                lower_level = lower,
                ratio,
                "compaction triggered"
            );
            let upper_ids = if upper == 0 {
                snapshot.l0.clone()
            } else {
                snapshot.levels[upper - 1].clone()
            };
            return Some(CompactionJob {
                upper_level: if upper == 0 { -1 } else { upper as i32 },
                upper_ids,
                lower_level: lower as u32,
                lower_ids: snapshot.levels[lower - 1].clone(),
            });
        }
        None
    }
}

/// Merge the task's tables into new lower-level tables, dropping versions
/// that no snapshot at or below `watermark` can observe.
pub fn compact(
    view: &StorageView,
    task: &CompactionJob,
    watermark: u64,
) -> Result<CompactionChange> {
    let snapshot = view.snapshot();

    // Upper tables first: on a versioned-key tie the newer copy must win.
    // Level 0 ids are already newest first.
    let mut sources: Vec<EntryIter> = Vec::new();
    for id in task.upper_ids.iter().chain(task.lower_ids.iter()) {
        sources.push(Box::new(snapshot.table(*id)?.iter()));
    }
    let merged = MergeIterator::new(sources)?;

    let target_size = view.config().sstable_size_bytes;
    let block_size = view.config().block_size_bytes;
    let mut produced = Vec::new();
    let mut builder: Option<SstBuilder> = None;

    let mut current_raw: Option<Vec<u8>> = None;
    let mut below_kept = false;
    let mut dropping = false;

    for item in merged {
        let (key, value) = item?;

        if current_raw.as_deref() != Some(key.raw()) {
            current_raw = Some(key.raw().to_vec());
            below_kept = false;
            dropping = false;

            // Split only at raw key boundaries so all versions of a key
            // land in one table
            let full = builder
                .as_ref()
                .map(|b| b.estimated_size() >= target_size)
                .unwrap_or(false);
            if full {
                if let Some(b) = builder.take() {
                    produced.push(b.finish()?);
                }
            }
        }

        let keep = if key.timestamp() > watermark {
            true
        } else if below_kept || dropping {
            false
        } else if is_tombstone(&value) {
            dropping = true;
            false
        } else {
            below_kept = true;
            true
        };
        if !keep {
            continue;
        }

        if builder.is_none() {
            let id = view.next_sst_id();
            builder = Some(SstBuilder::new(id, view.sst_path_for(id), block_size));
        }
        if let Some(b) = builder.as_mut() {
            b.add(key, value)?;
        }
    }

    if let Some(b) = builder {
        if !b.is_empty() {
            produced.push(b.finish()?);
        }
    }

    tracing::info!(
        upper_level = task.upper_level,
        lower_level = task.lower_level,
        consumed = task.upper_ids.len() + task.lower_ids.len(),
        produced = produced.len(),
        "compaction finished"
    );

    Ok(CompactionChange {
        upper_level: task.upper_level,
        lower_level: task.lower_level,
        consumed_upper: task.upper_ids.clone(),
        consumed_lower: task.lower_ids.clone(),
        produced,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Batch;
    use crate::config::Config;
    use std::ops::Bound;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn policy(trigger: usize, ratio: usize) -> SimpleLeveledPolicy {
        SimpleLeveledPolicy::new(
            CompactionConfig::default()
                .max_levels(3)
                .level0_files_compaction_trigger(trigger)
                .level_size_ratio_percentage(ratio),
        )
    }

    fn state_with_layout(l0: Vec<u64>, levels: Vec<Vec<u64>>) -> StorageState {
        let mut state = StorageState::new(Arc::new(crate::memtable::Memtable::create(0)), 3);
        state.l0 = l0;
        state.levels = levels;
        state
    }

    #[test]
    fn test_pick_requires_l0_trigger() {
        let policy = policy(4, 200);
        let state = state_with_layout(vec![3, 2, 1], vec![vec![], vec![], vec![]]);
        assert!(policy.pick(&state).is_none());

        let state = state_with_layout(vec![4, 3, 2, 1], vec![vec![], vec![], vec![]]);
        let task = policy.pick(&state).unwrap();
        assert_eq!(task.upper_level, -1);
        assert_eq!(task.upper_ids, vec![4, 3, 2, 1]);
        assert_eq!(task.lower_level, 1);
        assert!(task.lower_ids.is_empty());
    }

    #[test]
    fn test_pick_by_size_ratio() {
        let policy = policy(4, 200);
        // L1 has 4 tables, L2 has 2: ratio 50 < 200
        let state = state_with_layout(vec![], vec![vec![1, 2, 3, 4], vec![5, 6], vec![]]);
        let task = policy.pick(&state).unwrap();
        assert_eq!(task.upper_level, 1);
        assert_eq!(task.lower_level, 2);
        assert_eq!(task.lower_ids, vec![5, 6]);
    }

    #[test]
    fn test_pick_balanced_levels_idle() {
        let policy = policy(4, 200);
        let state = state_with_layout(vec![], vec![vec![1], vec![2, 3], vec![4, 5, 6, 7]]);
        assert!(policy.pick(&state).is_none());
    }

    fn view_with_l0(dir: &TempDir, batches: &[&[(&[u8], &[u8], u64)]]) -> Arc<StorageView> {
        let config = Arc::new(Config::new(dir.path()).memtable_size_bytes(1024));
        let (view, _) = StorageView::open(config).unwrap();
        let view = Arc::new(view);
        for entries in batches {
            for (raw, value, ts) in entries.iter() {
                let mut batch = Batch::new();
                if value.is_empty() {
                    batch.delete(raw.to_vec()).unwrap();
                } else {
                    batch.put(raw.to_vec(), value.to_vec()).unwrap();
                }
                view.apply_batch(&batch.stamp(*ts)).unwrap();
            }
            view.freeze_active().unwrap();
            assert!(view.force_flush_next_frozen().unwrap());
        }
        view
    }

    #[test]
    fn test_compact_merges_l0_into_l1() {
        let dir = TempDir::new().unwrap();
        let view = view_with_l0(
            &dir,
            &[
                &[(b"bolt".as_slice(), b"v1".as_slice(), 1)],
                &[(b"bolt".as_slice(), b"v2".as_slice(), 2)],
            ],
        );

        let snapshot = view.snapshot();
        let task = CompactionJob {
            upper_level: -1,
            upper_ids: snapshot.l0.clone(),
            lower_level: 1,
            lower_ids: vec![],
        };
        // Watermark above both versions: only the newest survives
        let change = compact(&view, &task, 5).unwrap();
        assert_eq!(change.produced.len(), 1);
        assert_eq!(change.produced[0].entry_count(), 1);

        let superseded = view.apply_compaction(change).unwrap();
        assert_eq!(superseded.len(), 2);

        let snapshot = view.snapshot();
        assert!(snapshot.l0.is_empty());
        assert_eq!(snapshot.levels[0].len(), 1);
        assert_eq!(view.get(b"bolt", 10).unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_compact_l0_over_existing_l1_table() {
        let dir = TempDir::new().unwrap();
        // Seed L1 with an old "bolt", then stack two L0 tables on top
        let view = view_with_l0(&dir, &[&[(b"bolt".as_slice(), b"old".as_slice(), 1)]]);
        let seed = CompactionJob {
            upper_level: -1,
            upper_ids: view.snapshot().l0.clone(),
            lower_level: 1,
            lower_ids: vec![],
        };
        let change = compact(&view, &seed, 5).unwrap();
        view.apply_compaction(change).unwrap();
        assert_eq!(view.snapshot().levels[0].len(), 1);

        for (value, ts) in [(b"newer".as_slice(), 2u64), (b"newest".as_slice(), 3u64)] {
            let mut batch = Batch::new();
            batch.put(b"bolt".to_vec(), value.to_vec()).unwrap();
            view.apply_batch(&batch.stamp(ts)).unwrap();
            view.freeze_active().unwrap();
            view.force_flush_next_frozen().unwrap();
        }
        let mut batch = Batch::new();
        batch.put(b"consensus".to_vec(), b"raft".to_vec()).unwrap();
        view.apply_batch(&batch.stamp(4)).unwrap();
        view.freeze_active().unwrap();
        view.force_flush_next_frozen().unwrap();

        let snapshot = view.snapshot();
        let job = CompactionJob {
            upper_level: -1,
            upper_ids: snapshot.l0.clone(),
            lower_level: 1,
            lower_ids: snapshot.levels[0].clone(),
        };
        let change = compact(&view, &job, 10).unwrap();
        assert_eq!(change.produced.len(), 1);
        view.apply_compaction(change).unwrap();

        // One surviving version per key, newest value wins
        let entries: Vec<(Vec<u8>, Vec<u8>)> = view
            .scan(Bound::Unbounded, Bound::Unbounded, 10)
            .unwrap()
            .map(|item| item.unwrap())
            .collect();
        assert_eq!(
            entries,
            vec![
                (b"bolt".to_vec(), b"newest".to_vec()),
                (b"consensus".to_vec(), b"raft".to_vec()),
            ]
        );
        let snapshot = view.snapshot();
        let table = snapshot.table(snapshot.levels[0][0]).unwrap();
        assert_eq!(table.entry_count(), 2);
    }

    #[test]
    fn test_compact_keeps_versions_above_watermark() {
        let dir = TempDir::new().unwrap();
        let view = view_with_l0(
            &dir,
            &[
                &[(b"bolt".as_slice(), b"v1".as_slice(), 1)],
                &[(b"bolt".as_slice(), b"v2".as_slice(), 2)],
            ],
        );

        let task = CompactionJob {
            upper_level: -1,
            upper_ids: view.snapshot().l0.clone(),
            lower_level: 1,
            lower_ids: vec![],
        };
        // A snapshot at ts 1 may still be reading v1
        let change = compact(&view, &task, 1).unwrap();
        assert_eq!(change.produced[0].entry_count(), 2);
    }

    #[test]
    fn test_compact_drops_tombstoned_key_below_watermark() {
        let dir = TempDir::new().unwrap();
        let view = view_with_l0(
            &dir,
            &[
                &[(b"doomed".as_slice(), b"value".as_slice(), 1)],
                &[(b"doomed".as_slice(), b"".as_slice(), 2)],
            ],
        );

        let task = CompactionJob {
            upper_level: -1,
            upper_ids: view.snapshot().l0.clone(),
            lower_level: 1,
            lower_ids: vec![],
        };
        let change = compact(&view, &task, 5).unwrap();
        // Tombstone and the version it shadows both disappear
        assert!(change.produced.is_empty());

        view.apply_compaction(change).unwrap();
        let snapshot = view.snapshot();
        assert!(snapshot.l0.is_empty());
        assert!(snapshot.levels[0].is_empty());
        assert_eq!(view.get(b"doomed", 10).unwrap(), None);
    }

    #[test]
    fn test_compact_preserves_visible_tombstone() {
        let dir = TempDir::new().unwrap();
        let view = view_with_l0(
            &dir,
            &[
                &[(b"doomed".as_slice(), b"value".as_slice(), 1)],
                &[(b"doomed".as_slice(), b"".as_slice(), 5)],
            ],
        );

        let task = CompactionJob {
            upper_level: -1,
            upper_ids: view.snapshot().l0.clone(),
            lower_level: 1,
            lower_ids: vec![],
        };
        // Watermark below the tombstone: a snapshot at 3 must still see the
        // old value, and the tombstone itself is still needed
        let change = compact(&view, &task, 3).unwrap();
        assert_eq!(change.produced[0].entry_count(), 2);

        view.apply_compaction(change).unwrap();
        assert_eq!(view.get(b"doomed", 3).unwrap(), Some(b"value".to_vec()));
        assert_eq!(view.get(b"doomed", 6).unwrap(), None);
    }

    #[test]
    fn test_compacted_scan_stays_correct() {
        let dir = TempDir::new().unwrap();
        let view = view_with_l0(
            &dir,
            &[
                &[(b"a".as_slice(), b"1".as_slice(), 1), (b"b".as_slice(), b"2".as_slice(), 1)],
                &[(b"b".as_slice(), b"2b".as_slice(), 2), (b"c".as_slice(), b"3".as_slice(), 2)],
            ],
        );

        let task = CompactionJob {
            upper_level: -1,
            upper_ids: view.snapshot().l0.clone(),
            lower_level: 1,
            lower_ids: vec![],
        };
        let change = compact(&view, &task, 5).unwrap();
        view.apply_compaction(change).unwrap();

        let entries: Vec<(Vec<u8>, Vec<u8>)> = view
            .scan(Bound::Unbounded, Bound::Unbounded, 10)
            .unwrap()
            .map(|item| item.unwrap())
            .collect();
        assert_eq!(
            entries,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2b".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }
}
