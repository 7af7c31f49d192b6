//! In-memory sorted table over a concurrent skip list.
//!
//! The memtable is the first stop for every committed write. It keys entries
//! by versioned [`Key`], so multiple versions of a raw key coexist and
//! iterate newest-first. Exactly one memtable is active (mutable) at a time;
//! freezing turns it read-only and queues it for flushing to a level-0
//! SSTable.
//!
//! `crossbeam-skiplist` gives lock-free concurrent reads while the single
//! commit executor performs writes, which is exactly the access pattern the
//! engine funnels through here.

use crate::error::Result;
use crate::key::{Key, TS_RANGE_BEGIN, TS_RANGE_END};
use crate::sstable::SstBuilder;
use crate::wal::Wal;

use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct Memtable {
    id: u64,
    map: Arc<SkipMap<Key, Vec<u8>>>,
    size: AtomicUsize,
    wal: Option<Wal>,
}

impl Memtable {
    /// Create an in-memory-only memtable. Used in tests and for rebuilding
    /// recovered state where the WAL has already been consumed.
    pub fn create(id: u64) -> Self {
        Self {
            id,
            map: Arc::new(SkipMap::new()),
            size: AtomicUsize::new(0),
            wal: None,
        }
    }

    /// Create an active memtable backed by a fresh write-ahead log.
    pub fn create_with_wal(id: u64, wal_path: impl AsRef<std::path::Path>) -> Result<Self> {
        let wal = Wal::create(wal_path)?;
        Ok(Self {
            id,
            map: Arc::new(SkipMap::new()),
            size: AtomicUsize::new(0),
            wal: Some(wal),
        })
    }

    /// Rebuild a memtable from its write-ahead log. Returns the memtable and
    /// the highest timestamp seen, which seeds the oracle's last commit
    /// timestamp during recovery. Recovered memtables are frozen immediately,
    /// so the log is not reopened for appending.
    pub fn recover(id: u64, wal_path: impl AsRef<std::path::Path>) -> Result<(Self, u64)> {
        let memtable = Self::create(id);
        let mut max_ts = 0;
        for (key, value) in Wal::replay(wal_path)? {
            max_ts = max_ts.max(key.timestamp());
            memtable
                .size
                .fetch_add(key.size() + value.len(), Ordering::SeqCst);
            memtable.map.insert(key, value);
        }
        Ok((memtable, max_ts))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Approximate byte footprint of all entries.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Insert one versioned entry, appending to the WAL first.
    pub fn put(&self, key: Key, value: Vec<u8>) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.append(&key, &value)?;
        }
        self.size
            .fetch_add(key.size() + value.len(), Ordering::SeqCst);
        self.map.insert(key, value);
        Ok(())
    }

    /// Newest version of `raw` with timestamp at or below `read_ts`. The
    /// returned value may be a tombstone; callers decide how to surface it.
    pub fn get(&self, raw: &[u8], read_ts: u64) -> Option<Vec<u8>> {
        let lower = Bound::Included(Key::new(raw.to_vec(), read_ts));
        let upper = Bound::Included(Key::new(raw.to_vec(), TS_RANGE_END));
        self.map
            .range((lower, upper))
            .next()
            .filter(|entry| entry.key().raw() == raw)
            .map(|entry| entry.value().clone())
    }

    /// Iterate versioned entries whose raw key falls within the bounds, in
    /// (raw ascending, timestamp descending) order. The iterator holds the
    /// skip list alive, so it stays valid after the memtable is dropped from
    /// the storage view.
    pub fn scan(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> MemtableIterator {
        let lower = match lower {
            Bound::Included(raw) => Bound::Included(Key::new(raw.to_vec(), TS_RANGE_BEGIN)),
            Bound::Excluded(raw) => Bound::Excluded(Key::new(raw.to_vec(), TS_RANGE_END)),
            Bound::Unbounded => Bound::Unbounded,
        };
        let upper = match upper {
            Bound::Included(raw) => Bound::Included(Key::new(raw.to_vec(), TS_RANGE_END)),
            Bound::Excluded(raw) => Bound::Excluded(Key::new(raw.to_vec(), TS_RANGE_BEGIN)),
            Bound::Unbounded => Bound::Unbounded,
        };
        MemtableIterator {
            map: Arc::clone(&self.map),
            lower,
            upper,
            last: None,
        }
    }

    /// Flush all buffered records of the WAL to disk.
    pub fn sync_wal(&self) -> Result<()> {
        match &self.wal {
            Some(wal) => wal.sync(),
            None => Ok(()),
        }
    }

    pub fn wal_path(&self) -> Option<&std::path::Path> {
        self.wal.as_ref().map(|wal| wal.path())
    }

    /// Stream every entry into an SSTable builder in key order.
    pub fn flush(&self, builder: &mut SstBuilder) -> Result<()> {
        for entry in self.map.iter() {
            builder.add(entry.key().clone(), entry.value().clone())?;
        }
        Ok(())
    }
}

/// Cursor-style iterator that re-seeks the skip list on each step. Holding
/// an `Arc` of the map keeps the entries alive independently of the
/// memtable's position in the storage view.
pub struct MemtableIterator {
    map: Arc<SkipMap<Key, Vec<u8>>>,
    lower: Bound<Key>,
    upper: Bound<Key>,
    last: Option<Key>,
}

impl Iterator for MemtableIterator {
    type Item = Result<(Key, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let lower = match &self.last {
            Some(key) => Bound::Excluded(key.clone()),
            None => self.lower.clone(),
        };
        let entry = self.map.range((lower, self.upper.clone())).next()?;
        let key = entry.key().clone();
        let value = entry.value().clone();
        self.last = Some(key.clone());
        Some(Ok((key, value)))
    }
}
