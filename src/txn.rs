//! Snapshot-isolated transactions.
//!
//! Both transaction kinds pin a read timestamp at creation and resolve every
//! read against that snapshot. A read-write [`Transaction`] buffers its
//! writes in a [`Batch`] and records a fingerprint of every key it reads;
//! at commit the oracle checks those fingerprints against transactions that
//! committed after the snapshot was taken, and the batch is applied through
//! the commit executor only if no overlap is found.

use crate::batch::Batch;
use crate::error::{Error, Result};
use crate::executor::CommitExecutor;
use crate::key::is_tombstone;
use crate::oracle::{fingerprint, Oracle};
use crate::view::StorageView;

use std::ops::Bound;
use std::sync::Arc;

/// A read-only snapshot of the store.
pub struct ReadTransaction {
    begin_ts: u64,
    view: Arc<StorageView>,
}

impl ReadTransaction {
    pub(crate) fn new(begin_ts: u64, view: Arc<StorageView>) -> Self {
        Self { begin_ts, view }
    }

    pub fn begin_ts(&self) -> u64 {
        self.begin_ts
    }

    pub fn get(&self, raw: &[u8]) -> Result<Option<Vec<u8>>> {
        self.view.get(raw, self.begin_ts)
    }

    /// All visible entries whose raw key falls within the bounds, in key
    /// order.
    pub fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.view
            .scan(lower, upper, self.begin_ts)?
            .collect()
    }
}

/// A read-write transaction. Writes stay buffered until commit; reads see
/// the snapshot overlaid with this transaction's own pending writes.
pub struct Transaction {
    begin_ts: u64,
    view: Arc<StorageView>,
    batch: Batch,
    read_fingerprints: Vec<u64>,
}

impl Transaction {
    pub(crate) fn new(begin_ts: u64, view: Arc<StorageView>) -> Self {
        Self {
            begin_ts,
            view,
            batch: Batch::new(),
            read_fingerprints: Vec::new(),
        }
    }

    pub fn begin_ts(&self) -> u64 {
        self.begin_ts
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.batch.put(key, value)
    }

    pub fn delete(&mut self, key: Vec<u8>) -> Result<()> {
        self.batch.delete(key)
    }

    /// Read a key, preferring this transaction's own pending write. The
    /// read is recorded for conflict detection either way.
    pub fn get(&mut self, raw: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read_fingerprints.push(fingerprint(raw));
        if let Some(value) = self.batch.get(raw) {
            return Ok(if is_tombstone(value) {
                None
            } else {
                Some(value.to_vec())
            });
        }
        self.view.get(raw, self.begin_ts)
    }

    /// Scan the snapshot overlaid with pending writes. Every returned key is
    /// recorded as read.
    pub fn scan(
        &mut self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut local: Vec<(Vec<u8>, Vec<u8>)> = self
            .batch
            .entries()
            .iter()
            .filter(|(raw, _)| {
                (match lower {
                    Bound::Included(b) => raw.as_slice() >= b,
                    Bound::Excluded(b) => raw.as_slice() > b,
                    Bound::Unbounded => true,
                }) && (match upper {
                    Bound::Included(b) => raw.as_slice() <= b,
                    Bound::Excluded(b) => raw.as_slice() < b,
                    Bound::Unbounded => true,
                })
            })
            .cloned()
            .collect();
        local.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::new();
        let mut local = local.into_iter().peekable();
        let mut storage = self.view.scan(lower, upper, self.begin_ts)?;

        let mut next_storage = storage.next().transpose()?;
        loop {
            match (local.peek(), &next_storage) {
                (Some((lraw, _)), Some((sraw, _))) if lraw == sraw => {
                    // Pending write shadows the stored version
                    let (raw, value) = local.next().unwrap_or_default();
                    next_storage = storage.next().transpose()?;
                    if !is_tombstone(&value) {
                        out.push((raw, value));
                    }
                }
                (Some((lraw, _)), Some((sraw, _))) if lraw < sraw => {
                    let (raw, value) = local.next().unwrap_or_default();
                    if !is_tombstone(&value) {
                        out.push((raw, value));
                    }
                }
                (Some(_), None) => {
                    let (raw, value) = local.next().unwrap_or_default();
                    if !is_tombstone(&value) {
                        out.push((raw, value));
                    }
                }
                (_, Some(_)) => {
                    if let Some(entry) = next_storage.take() {
                        out.push(entry);
                    }
                    next_storage = storage.next().transpose()?;
                }
                (None, None) => break,
            }
        }

        for (raw, _) in &out {
            self.read_fingerprints.push(fingerprint(raw));
        }
        Ok(out)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Run conflict detection, stamp the batch, and hand it to the commit
    /// executor. Resolves once the batch is durable.
    pub(crate) async fn commit(
        self,
        oracle: &Oracle,
        executor: &CommitExecutor,
    ) -> Result<()> {
        if self.batch.is_empty() {
            return Err(Error::EmptyTransaction);
        }
        let write_fingerprints: Vec<u64> = self
            .batch
            .entries()
            .iter()
            .map(|(raw, _)| fingerprint(raw))
            .collect();

        // Holding the commit lock across submit ties queue order to commit
        // timestamp order
        let ack = {
            let _guard = oracle.lock_commits().await;
            let commit_ts = oracle.commit_timestamp(
                self.begin_ts,
                &self.read_fingerprints,
                &write_fingerprints,
            )?;
            match executor.submit(self.batch.stamp(commit_ts)) {
                Ok(ack) => ack,
                Err(e) => {
                    oracle.done_commit(commit_ts);
                    return Err(e);
                }
            }
        };

        match ack.await {
            Ok(result) => result,
            Err(_) => Err(Error::EngineStopped),
        }
    }
}
