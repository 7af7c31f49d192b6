//! Rebuilding the store layout from the manifest.
//!
//! Replaying the manifest events in order reproduces the exact shape of the
//! store at shutdown: which memtables were still live (unflushed), which
//! table ids sit in which level, and the highest ids ever allocated. The
//! caller then reopens the live memtables from their write-ahead logs and
//! the tables from their files.

use crate::error::{Error, Result};
use crate::manifest::Event;

/// Layout reconstructed from a manifest replay.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveredLayout {
    /// Live memtable ids in creation order (oldest first).
    pub live_memtables: Vec<u64>,
    /// Level-0 table ids, newest first.
    pub l0: Vec<u64>,
    /// `levels[i]` holds level `i + 1` in key order.
    pub levels: Vec<Vec<u64>>,
    pub next_memtable_id: u64,
    pub next_sst_id: u64,
}

impl RecoveredLayout {
    pub fn replay(events: &[Event], max_levels: usize) -> Result<Self> {
        let mut layout = Self {
            levels: vec![Vec::new(); max_levels],
            next_memtable_id: 1,
            next_sst_id: 1,
            ..Default::default()
        };

        for event in events {
            match event {
                Event::MemtableCreated { id } => {
                    layout.live_memtables.push(*id);
                    layout.next_memtable_id = layout.next_memtable_id.max(id + 1);
                }
                Event::SstFlushed {
                    memtable_id,
                    sst_id,
                } => {
                    let pos = layout
                        .live_memtables
                        .iter()
                        .position(|id| id == memtable_id)
                        .ok_or_else(|| {
                            Error::Corruption(format!(
                                "flush of unknown memtable {}",
                                memtable_id
                            ))
                        })?;
                    layout.live_memtables.remove(pos);
                    layout.l0.insert(0, *sst_id);
                    layout.next_sst_id = layout.next_sst_id.max(sst_id + 1);
                }
                Event::CompactionDone {
                    upper_level,
                    lower_level,
                    consumed,
                    produced,
                } => {
                    if *lower_level == 0 {
                        return Err(Error::Corruption(
                            "compaction into level 0".to_string(),
                        ));
                    }
                    let lower_idx = *lower_level as usize - 1;
                    if lower_idx >= layout.levels.len() {
                        return Err(Error::Corruption(format!(
                            "compaction into unknown level {}",
                            lower_level
                        )));
                    }
                    if *upper_level < 0 {
                        layout.l0.retain(|id| !consumed.contains(id));
                    } else {
                        let upper_idx = *upper_level as usize - 1;
                        layout.levels[upper_idx].retain(|id| !consumed.contains(id));
                    }
                    layout.levels[lower_idx] = produced.clone();
                    for id in produced {
                        layout.next_sst_id = layout.next_sst_id.max(id + 1);
                    }
                }
            }
        }
        Ok(layout)
    }

    /// Every table id referenced by the final layout.
    pub fn table_ids(&self) -> Vec<u64> {
        let mut ids = self.l0.clone();
        for level in &self.levels {
            ids.extend_from_slice(level);
        }
        ids
    }
}
