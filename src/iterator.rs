//! Merging and filtering iterators over versioned entry streams.
//!
//! Every storage source (memtable, SSTable) yields `(Key, value)` pairs in
//! key order. [`MergeIterator`] folds any number of such streams into one,
//! preferring lower-numbered sources when the same versioned key appears in
//! several. Scans layer [`VisibilityIterator`] on top to apply snapshot
//! filtering, while compaction consumes the merged stream directly so that
//! it sees every surviving version.

use crate::error::Result;
use crate::key::{is_tombstone, Key};

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::ops::Bound;

/// A boxed stream of versioned entries in ascending [`Key`] order.
pub type EntryIter = Box<dyn Iterator<Item = Result<(Key, Vec<u8>)>> + Send>;

struct HeapEntry {
    key: Key,
    value: Vec<u8>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest key surfaces,
        // with the lowest source index winning ties
        self.key
            .cmp(&other.key)
            .then_with(|| self.source.cmp(&other.source))
            .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// K-way merge over entry streams. Sources are priority-ordered: when two
/// streams contain an entry for the same versioned key, the stream with the
/// lower index supplies the value and the others are discarded.
pub struct MergeIterator {
    sources: Vec<EntryIter>,
    heap: BinaryHeap<HeapEntry>,
    latest_key: Option<Key>,
    failed: bool,
}

impl MergeIterator {
    pub fn new(sources: Vec<EntryIter>) -> Result<Self> {
        let mut iter = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            latest_key: None,
            failed: false,
        };
        for source in 0..iter.sources.len() {
            iter.advance(source)?;
        }
        Ok(iter)
    }

    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some(item) = self.sources[source].next() {
            let (key, value) = item?;
            self.heap.push(HeapEntry { key, value, source });
        }
        Ok(())
    }
}

impl Iterator for MergeIterator {
    type Item = Result<(Key, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let entry = self.heap.pop()?;
            if let Err(e) = self.advance(entry.source) {
                self.failed = true;
                return Some(Err(e));
            }
            if self.latest_key.as_ref() == Some(&entry.key) {
                continue;
            }
            self.latest_key = Some(entry.key.clone());
            return Some(Ok((entry.key, entry.value)));
        }
    }
}

/// Cuts an entry stream off at an upper bound on the raw key.
pub struct BoundedIterator {
    inner: EntryIter,
    upper: Bound<Vec<u8>>,
    done: bool,
}

impl BoundedIterator {
    pub fn new(inner: EntryIter, upper: Bound<Vec<u8>>) -> Self {
        Self {
            inner,
            upper,
            done: false,
        }
    }
}

impl Iterator for BoundedIterator {
    type Item = Result<(Key, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.inner.next()?;
        if let Ok((key, _)) = &item {
            let beyond = match &self.upper {
                Bound::Included(upper) => key.raw() > upper.as_slice(),
                Bound::Excluded(upper) => key.raw() >= upper.as_slice(),
                Bound::Unbounded => false,
            };
            if beyond {
                self.done = true;
                return None;
            }
        }
        Some(item)
    }
}

/// Applies snapshot visibility to a merged stream: for each raw key, the
/// newest version at or below `read_ts` decides the outcome. Tombstones
/// hide the key; older versions are never surfaced.
pub struct VisibilityIterator {
    inner: EntryIter,
    read_ts: u64,
    current_raw: Option<Vec<u8>>,
}

impl VisibilityIterator {
    pub fn new(inner: EntryIter, read_ts: u64) -> Self {
        Self {
            inner,
            read_ts,
            current_raw: None,
        }
    }
}

impl Iterator for VisibilityIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, value) = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            if key.timestamp() > self.read_ts {
                continue;
            }
            if self.current_raw.as_deref() == Some(key.raw()) {
                continue;
            }
            self.current_raw = Some(key.raw().to_vec());
            if is_tombstone(&value) {
                continue;
            }
            return Some(Ok((key.into_raw(), value)));
        }
    }
}
