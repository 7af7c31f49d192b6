//! The layered storage view.
//!
//! `StorageView` owns the live [`StorageState`] and every structural
//! transition: freezing the active memtable, flushing frozen memtables to
//! level 0, and swapping compaction results into the level layout. Reads
//! resolve against a snapshot of the state in layer order, newest data
//! first: active memtable, frozen memtables, level 0, then the sorted
//! levels.
//!
//! Structural transitions serialize on `state_lock` and append to the
//! manifest before the in-memory swap, so a crash at any point replays to a
//! layout no newer than what readers ever observed.

use crate::batch::TimestampedBatch;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::iterator::{BoundedIterator, EntryIter, MergeIterator, VisibilityIterator};
use crate::key::{is_tombstone, Key, TS_RANGE_BEGIN, TS_RANGE_END};
use crate::manifest::{Event, Manifest};
use crate::memtable::Memtable;
use crate::recovery::RecoveredLayout;
use crate::sstable::{Sst, SstBuilder};
use crate::state::{CompactionChange, StorageState};

use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

fn wal_path(dir: &Path, id: u64) -> PathBuf {
    dir.join("wal").join(format!("{:05}.wal", id))
}

fn sst_path(dir: &Path, id: u64) -> PathBuf {
    dir.join("sst").join(format!("{:05}.sst", id))
}

pub struct StorageView {
    config: Arc<Config>,
    state: RwLock<Arc<StorageState>>,
    /// Serializes structural transitions (freeze, flush, compaction swap).
    state_lock: Mutex<()>,
    manifest: Manifest,
    next_memtable_id: AtomicU64,
    next_sst_id: AtomicU64,
}

impl std::fmt::Debug for StorageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageView")
            .field("dir", &self.config.dir)
            .finish()
    }
}

impl StorageView {
    /// Open or create the store under `config.dir`. Returns the view and the
    /// highest commit timestamp found in persisted data, which seeds the
    /// oracle's clock.
    pub fn open(config: Arc<Config>) -> Result<(Self, u64)> {
        std::fs::create_dir_all(config.dir.join("wal"))?;
        std::fs::create_dir_all(config.dir.join("sst"))?;
        let manifest_path = config.dir.join("MANIFEST");

        if manifest_path.exists() {
            Self::recover(config, &manifest_path)
        } else {
            let manifest = Manifest::create(&manifest_path)?;
            let active = Arc::new(Memtable::create_with_wal(1, wal_path(&config.dir, 1))?);
            manifest.append(&Event::MemtableCreated { id: 1 })?;
            let state = StorageState::new(active, config.compaction.max_levels);
            Ok((
                Self {
                    config,
                    state: RwLock::new(Arc::new(state)),
                    state_lock: Mutex::new(()),
                    manifest,
                    next_memtable_id: AtomicU64::new(2),
                    next_sst_id: AtomicU64::new(1),
                },
                0,
            ))
        }
    }

    fn recover(config: Arc<Config>, manifest_path: &Path) -> Result<(Self, u64)> {
        let (manifest, events) = Manifest::recover(manifest_path)?;
        let layout = RecoveredLayout::replay(&events, config.compaction.max_levels)?;
        let mut last_commit_ts = 0;

        let mut state = StorageState::new(
            Arc::new(Memtable::create(0)),
            config.compaction.max_levels,
        );
        for id in layout.table_ids() {
            let table = Sst::open(id, sst_path(&config.dir, id))?;
            last_commit_ts = last_commit_ts.max(table.max_ts());
            state.tables.insert(id, table);
        }
        state.l0 = layout.l0;
        state.levels = layout.levels;

        // Live memtables come back frozen; a fresh active takes over writes.
        // A missing WAL means the memtable was dropped empty.
        for id in &layout.live_memtables {
            let path = wal_path(&config.dir, *id);
            if !path.exists() {
                continue;
            }
            let (memtable, max_ts) = Memtable::recover(*id, path)?;
            last_commit_ts = last_commit_ts.max(max_ts);
            if memtable.is_empty() {
                continue;
            }
            state.frozen.insert(0, Arc::new(memtable));
        }

        let active_id = layout.next_memtable_id;
        let active = Arc::new(Memtable::create_with_wal(
            active_id,
            wal_path(&config.dir, active_id),
        )?);
        manifest.append(&Event::MemtableCreated { id: active_id })?;
        state.active = active;

        tracing::info!(
            frozen = state.frozen.len(),
            l0 = state.l0.len(),
            last_commit_ts,
            "store recovered"
        );

        Ok((
            Self {
                config,
                state: RwLock::new(Arc::new(state)),
                state_lock: Mutex::new(()),
                manifest,
                next_memtable_id: AtomicU64::new(active_id + 1),
                next_sst_id: AtomicU64::new(layout.next_sst_id),
            },
            last_commit_ts,
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The current state snapshot. Holds every source alive via `Arc`.
    pub fn snapshot(&self) -> Arc<StorageState> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&state)
    }

    pub fn next_sst_id(&self) -> u64 {
        self.next_sst_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn sst_path_for(&self, id: u64) -> PathBuf {
        sst_path(&self.config.dir, id)
    }

    pub fn frozen_count(&self) -> usize {
        self.snapshot().frozen.len()
    }

    /// Newest value of `raw` visible at `read_ts`. Tombstones resolve to
    /// `None`.
    pub fn get(&self, raw: &[u8], read_ts: u64) -> Result<Option<Vec<u8>>> {
        let snapshot = self.snapshot();

        if let Some(value) = snapshot.active.get(raw, read_ts) {
            return Ok(visible(value));
        }
        for memtable in &snapshot.frozen {
            if let Some(value) = memtable.get(raw, read_ts) {
                return Ok(visible(value));
            }
        }

        for id in &snapshot.l0 {
            let table = snapshot.table(*id)?;
            if !table.may_contain(raw) {
                continue;
            }
            if let Some(value) = table.get(raw, read_ts)? {
                return Ok(visible(value));
            }
        }

        for level in &snapshot.levels {
            // Non-overlapping and sorted, so at most one table can hold raw
            let idx = level.partition_point(|id| {
                snapshot
                    .tables
                    .get(id)
                    .map(|t| t.last_key().raw() < raw)
                    .unwrap_or(false)
            });
            if let Some(id) = level.get(idx) {
                let table = snapshot.table(*id)?;
                if !table.may_contain(raw) {
                    continue;
                }
                if let Some(value) = table.get(raw, read_ts)? {
                    return Ok(visible(value));
                }
            }
        }

        Ok(None)
    }

    /// Merged scan over every layer, filtered to the snapshot at `read_ts`.
    pub fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        read_ts: u64,
    ) -> Result<VisibilityIterator> {
        let snapshot = self.snapshot();
        let mut sources: Vec<EntryIter> = Vec::new();

        sources.push(Box::new(snapshot.active.scan(lower, upper)));
        for memtable in &snapshot.frozen {
            sources.push(Box::new(memtable.scan(lower, upper)));
        }

        let seek_key = match lower {
            Bound::Included(raw) => Some(Key::new(raw.to_vec(), TS_RANGE_BEGIN)),
            // Commit timestamps start at 1, so (raw, 0) never exists and
            // seeking to it lands on the next raw key
            Bound::Excluded(raw) => Some(Key::new(raw.to_vec(), TS_RANGE_END)),
            Bound::Unbounded => None,
        };

        let mut add_table = |table: &Arc<Sst>| {
            let in_range = match lower {
                Bound::Included(raw) => table.last_key().raw() >= raw,
                Bound::Excluded(raw) => table.last_key().raw() > raw,
                Bound::Unbounded => true,
            } && match upper {
                Bound::Included(raw) => table.first_key().raw() <= raw,
                Bound::Excluded(raw) => table.first_key().raw() < raw,
                Bound::Unbounded => true,
            };
            if in_range {
                let iter = match &seek_key {
                    Some(key) => table.seek(key),
                    None => table.iter(),
                };
                sources.push(Box::new(iter));
            }
        };

        for id in &snapshot.l0 {
            add_table(snapshot.table(*id)?);
        }
        for level in &snapshot.levels {
            for id in level {
                add_table(snapshot.table(*id)?);
            }
        }

        let merged = MergeIterator::new(sources)?;
        let bounded = BoundedIterator::new(
            Box::new(merged),
            match upper {
                Bound::Included(raw) => Bound::Included(raw.to_vec()),
                Bound::Excluded(raw) => Bound::Excluded(raw.to_vec()),
                Bound::Unbounded => Bound::Unbounded,
            },
        );
        Ok(VisibilityIterator::new(Box::new(bounded), read_ts))
    }

    /// Apply one committed batch to the active memtable, freezing first if
    /// the batch does not fit.
    pub fn apply_batch(&self, batch: &TimestampedBatch) -> Result<()> {
        {
            let snapshot = self.snapshot();
            if !snapshot.active.is_empty()
                && snapshot.active.size() + batch.size() > self.config.memtable_size_bytes
            {
                self.freeze_active()?;
            }
        }
        let snapshot = self.snapshot();
        for (key, value) in batch.entries() {
            snapshot.active.put(key.clone(), value.clone())?;
        }
        snapshot.active.sync_wal()
    }

    /// Swap in a fresh active memtable, pushing the current one onto the
    /// frozen queue.
    pub fn freeze_active(&self) -> Result<()> {
        let _guard = self
            .state_lock
            .lock()
            .map_err(|_| Error::InvalidState("state lock poisoned".to_string()))?;

        let id = self.next_memtable_id.fetch_add(1, Ordering::SeqCst);
        let memtable = Arc::new(Memtable::create_with_wal(
            id,
            wal_path(&self.config.dir, id),
        )?);
        self.manifest.append(&Event::MemtableCreated { id })?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let mut next = StorageState::clone(&state);
        let old_active = std::mem::replace(&mut next.active, memtable);
        old_active.sync_wal()?;
        next.frozen.insert(0, old_active);
        *state = Arc::new(next);
        tracing::debug!(memtable_id = id, "active memtable frozen");
        Ok(())
    }

    /// Flush the oldest frozen memtable into a level-0 table. Returns false
    /// when there is nothing to flush.
    pub fn force_flush_next_frozen(&self) -> Result<bool> {
        let _guard = self
            .state_lock
            .lock()
            .map_err(|_| Error::InvalidState("state lock poisoned".to_string()))?;

        let snapshot = self.snapshot();
        let Some(memtable) = snapshot.frozen.last().cloned() else {
            return Ok(false);
        };

        if memtable.is_empty() {
            {
                let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                let mut next = StorageState::clone(&state);
                next.frozen.pop();
                *state = Arc::new(next);
            }
            let _ = std::fs::remove_file(wal_path(&self.config.dir, memtable.id()));
            return Ok(true);
        }

        let sst_id = self.next_sst_id();
        let mut builder = SstBuilder::new(
            sst_id,
            sst_path(&self.config.dir, sst_id),
            self.config.block_size_bytes,
        );
        memtable.flush(&mut builder)?;
        let table = builder.finish()?;

        self.manifest.append(&Event::SstFlushed {
            memtable_id: memtable.id(),
            sst_id,
        })?;

        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let mut next = StorageState::clone(&state);
            next.frozen.pop();
            next.l0.insert(0, sst_id);
            next.tables.insert(sst_id, table);
            *state = Arc::new(next);
        }

        let wal = wal_path(&self.config.dir, memtable.id());
        if let Err(e) = std::fs::remove_file(&wal) {
            tracing::warn!(path = %wal.display(), error = %e, "failed to remove flushed WAL");
        }
        tracing::debug!(memtable_id = memtable.id(), sst_id, "memtable flushed");
        Ok(true)
    }

    /// Swap a finished compaction into the layout. Returns the superseded
    /// tables so the cleaner can delete their files once unreferenced.
    pub fn apply_compaction(&self, change: CompactionChange) -> Result<Vec<Arc<Sst>>> {
        let _guard = self
            .state_lock
            .lock()
            .map_err(|_| Error::InvalidState("state lock poisoned".to_string()))?;

        self.manifest.append(&Event::CompactionDone {
            upper_level: change.upper_level,
            lower_level: change.lower_level,
            consumed: change.consumed(),
            produced: change.produced_ids(),
        })?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let mut next = StorageState::clone(&state);

        let mut superseded = Vec::new();
        for id in change.consumed() {
            if let Some(table) = next.tables.remove(&id) {
                superseded.push(table);
            }
        }
        if change.upper_level < 0 {
            next.l0.retain(|id| !change.consumed_upper.contains(id));
        } else {
            let idx = change.upper_level as usize - 1;
            next.levels[idx].retain(|id| !change.consumed_upper.contains(id));
        }
        let lower_idx = change.lower_level as usize - 1;
        next.levels[lower_idx] = change.produced_ids();
        for table in &change.produced {
            next.tables.insert(table.id(), Arc::clone(table));
        }

        *state = Arc::new(next);
        Ok(superseded)
    }

    /// Fsync the active memtable's WAL. Called on shutdown.
    pub fn sync(&self) -> Result<()> {
        self.snapshot().active.sync_wal()
    }
}

fn visible(value: Vec<u8>) -> Option<Vec<u8>> {
    if is_tombstone(&value) {
        None
    } else {
        Some(value)
    }
}
