//! Deferred deletion of superseded table files.
//!
//! Compaction removes tables from the layout, but a scan that captured an
//! older snapshot may still be reading them. Every reader path holds the
//! table through its `Arc`, so a table is safe to delete exactly when the
//! cleaner holds the last reference.

use crate::error::{Error, Result};
use crate::sstable::Sst;

use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct TableCleaner {
    pending: Mutex<Vec<Arc<Sst>>>,
}

impl TableCleaner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue superseded tables for deletion.
    pub fn submit(&self, tables: Vec<Arc<Sst>>) -> Result<()> {
        if tables.is_empty() {
            return Ok(());
        }
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| Error::InvalidState("cleaner lock poisoned".to_string()))?;
        pending.extend(tables);
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Delete every queued table that no reader references anymore. Returns
    /// the number of files removed; still-referenced tables stay queued.
    pub fn reclaim(&self) -> Result<usize> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| Error::InvalidState("cleaner lock poisoned".to_string()))?;

        let mut removed = 0;
        let mut keep = Vec::with_capacity(pending.len());
        for table in pending.drain(..) {
            if Arc::strong_count(&table) > 1 {
                keep.push(table);
                continue;
            }
            let path = table.path().to_path_buf();
            let id = table.id();
            drop(table);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::debug!(table_id = id, "superseded table deleted");
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(table_id = id, error = %e, "failed to delete table file");
                }
            }
        }
        *pending = keep;
        Ok(removed)
    }
}
