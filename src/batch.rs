//! Write batches buffered by read-write transactions.

use crate::error::{Error, Result};
use crate::key::Key;

/// An unstamped batch of writes, keyed by raw key. Deletes carry an empty
/// value, which becomes a tombstone once the batch is applied.
#[derive(Debug, Default)]
pub struct Batch {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a put. Rejects zero-length values (reserved for tombstones)
    /// and raw keys already present in this batch.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        if value.is_empty() {
            return Err(Error::EmptyValue);
        }
        self.insert(key, value)
    }

    /// Buffer a delete as a tombstone entry.
    pub fn delete(&mut self, key: Vec<u8>) -> Result<()> {
        self.insert(key, Vec::new())
    }

    fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        if self.entries.iter().any(|(k, _)| *k == key) {
            return Err(Error::DuplicateKeyInBatch);
        }
        self.entries.push((key, value));
        Ok(())
    }

    /// Most recent buffered write for a raw key, if any. The value may be
    /// empty when the batch holds a delete for the key.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.entries
    }

    /// Stamp every entry with the commit timestamp assigned by the oracle.
    pub fn stamp(self, commit_ts: u64) -> TimestampedBatch {
        TimestampedBatch {
            commit_ts,
            entries: self
                .entries
                .into_iter()
                .map(|(k, v)| (Key::new(k, commit_ts), v))
                .collect(),
        }
    }
}

/// A committed batch whose entries carry their commit timestamp. This is the
/// unit of work submitted to the commit executor.
#[derive(Debug)]
pub struct TimestampedBatch {
    commit_ts: u64,
    entries: Vec<(Key, Vec<u8>)>,
}

impl TimestampedBatch {
    pub fn commit_ts(&self) -> u64 {
        self.commit_ts
    }

    pub fn entries(&self) -> &[(Key, Vec<u8>)] {
        &self.entries
    }

    /// Total byte footprint, used to decide whether the batch fits in the
    /// active memtable.
    pub fn size(&self) -> usize {
        self.entries
            .iter()
            .map(|(k, v)| k.size() + v.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let mut batch = Batch::new();
        batch.put(b"consensus".to_vec(), b"raft".to_vec()).unwrap();
        assert_eq!(batch.get(b"consensus"), Some(b"raft".as_slice()));
        assert_eq!(batch.get(b"storage"), None);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut batch = Batch::new();
        batch.put(b"consensus".to_vec(), b"raft".to_vec()).unwrap();
        assert!(matches!(
            batch.put(b"consensus".to_vec(), b"paxos".to_vec()),
            Err(Error::DuplicateKeyInBatch)
        ));
        assert!(matches!(
            batch.delete(b"consensus".to_vec()),
            Err(Error::DuplicateKeyInBatch)
        ));
    }

    #[test]
    fn test_empty_value_rejected() {
        let mut batch = Batch::new();
        assert!(matches!(
            batch.put(b"consensus".to_vec(), Vec::new()),
            Err(Error::EmptyValue)
        ));
    }

    #[test]
    fn test_delete_buffers_tombstone() {
        let mut batch = Batch::new();
        batch.delete(b"consensus".to_vec()).unwrap();
        assert_eq!(batch.get(b"consensus"), Some(b"".as_slice()));
    }

    #[test]
    fn test_stamp_assigns_commit_timestamp() {
        let mut batch = Batch::new();
        batch.put(b"consensus".to_vec(), b"raft".to_vec()).unwrap();
        batch.delete(b"storage".to_vec()).unwrap();

        let stamped = batch.stamp(7);
        assert_eq!(stamped.commit_ts(), 7);
        for (key, _) in stamped.entries() {
            assert_eq!(key.timestamp(), 7);
        }
    }
}
