//! Immutable snapshot of the store's shape.
//!
//! The live [`StorageState`] sits behind an `RwLock<Arc<_>>`. Mutations
//! clone the current state, modify the clone, and swap it in, so readers
//! always operate on a coherent snapshot without blocking writers. Every
//! memtable and table is held by `Arc`; an iterator that captured a snapshot
//! keeps its sources alive even after flush or compaction replaces them.

use crate::error::{Error, Result};
use crate::memtable::Memtable;
use crate::sstable::Sst;

use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct StorageState {
    /// The one mutable memtable receiving writes.
    pub active: Arc<Memtable>,
    /// Frozen memtables awaiting flush, newest first.
    pub frozen: Vec<Arc<Memtable>>,
    /// Level-0 table ids, newest first. Tables may overlap.
    pub l0: Vec<u64>,
    /// `levels[i]` holds level `i + 1`: key-ordered, non-overlapping tables.
    pub levels: Vec<Vec<u64>>,
    /// Every open table in the layout, by id.
    pub tables: HashMap<u64, Arc<Sst>>,
}

impl StorageState {
    pub fn new(active: Arc<Memtable>, max_levels: usize) -> Self {
        Self {
            active,
            frozen: Vec::new(),
            l0: Vec::new(),
            levels: vec![Vec::new(); max_levels],
            tables: HashMap::new(),
        }
    }

    pub fn table(&self, id: u64) -> Result<&Arc<Sst>> {
        self.tables
            .get(&id)
            .ok_or_else(|| Error::InvalidState(format!("table {} not in layout", id)))
    }

    /// All live memtable ids, oldest first. Ids are allocated monotonically,
    /// so this is always ascending.
    pub fn memtable_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.frozen.iter().rev().map(|m| m.id()).collect();
        ids.push(self.active.id());
        ids
    }
}

/// Outcome of one compaction, ready to be swapped into the layout.
/// `upper_level` is -1 when the upper level is level 0.
#[derive(Debug)]
pub struct CompactionChange {
    pub upper_level: i32,
    pub lower_level: u32,
    pub consumed_upper: Vec<u64>,
    pub consumed_lower: Vec<u64>,
    pub produced: Vec<Arc<Sst>>,
}

impl CompactionChange {
    pub fn consumed(&self) -> Vec<u64> {
        let mut ids = self.consumed_upper.clone();
        ids.extend_from_slice(&self.consumed_lower);
        ids
    }

    pub fn produced_ids(&self) -> Vec<u64> {
        self.produced.iter().map(|t| t.id()).collect()
    }
}
