//! Versioned keys and their ordering.
//!
//! Every entry in the engine is addressed by a `Key`: the raw user key plus
//! the commit timestamp of the write that produced it. The same raw key may
//! appear many times with different timestamps; no two entries share an
//! identical (raw, timestamp) pair.
//!
//! Keys order by raw bytes ascending with ties broken by timestamp
//! *descending*, so any ordered stream (memtable, SSTable block, merge
//! iterator) yields the newest version of a raw key first. A reader looking
//! for the newest version visible at `read_ts` seeks to `(raw, read_ts)` and
//! takes the first entry with a matching raw key.

use std::cmp::Ordering;

/// Timestamp bound that sorts before every version of a raw key.
pub const TS_RANGE_BEGIN: u64 = u64::MAX;
/// Timestamp bound that sorts after every version of a raw key.
pub const TS_RANGE_END: u64 = 0;

/// A raw user key paired with the commit timestamp of its write.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    raw: Vec<u8>,
    timestamp: u64,
}

impl Key {
    pub fn new(raw: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Self {
            raw: raw.into(),
            timestamp,
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }

    /// Approximate in-memory footprint, used for memtable budgeting.
    pub fn size(&self) -> usize {
        self.raw.len() + std::mem::size_of::<u64>()
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw
            .cmp(&other.raw)
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A value payload. Zero length is the tombstone sentinel; a missing key is
/// represented by the key not appearing at all.
pub fn is_tombstone(value: &[u8]) -> bool {
    value.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orders_by_raw_key_ascending() {
        let a = Key::new(b"apple".to_vec(), 5);
        let b = Key::new(b"banana".to_vec(), 5);
        assert!(a < b);
    }

    #[test]
    fn test_same_raw_key_orders_newest_first() {
        let newer = Key::new(b"consensus".to_vec(), 10);
        let older = Key::new(b"consensus".to_vec(), 6);
        assert!(newer < older);
    }

    #[test]
    fn test_ts_range_bounds_bracket_all_versions() {
        let begin = Key::new(b"k".to_vec(), TS_RANGE_BEGIN);
        let version = Key::new(b"k".to_vec(), 42);
        let end = Key::new(b"k".to_vec(), TS_RANGE_END);
        assert!(begin < version);
        assert!(version < end);
    }

    #[test]
    fn test_tombstone_sentinel() {
        assert!(is_tombstone(b""));
        assert!(!is_tombstone(b"raft"));
    }
}
