//! Timestamp oracle: allocation, conflict detection, and visibility bounds.
//!
//! The oracle owns the logical clock. Read timestamps are `next_ts - 1`, so
//! a snapshot sees every commit that finished before it began and nothing
//! after. Commit timestamps are allocated under the commit lock, which the
//! transaction holds until its batch is handed to the commit executor; that
//! makes submission order identical to commit timestamp order.
//!
//! Conflict detection is optimistic. Each committed transaction leaves a
//! window entry holding the fingerprints of the keys it wrote. A committing
//! transaction conflicts when any key it read was written by a transaction
//! that committed after the reader's snapshot was taken. Entries older than
//! the begin watermark can no longer conflict with anyone and are pruned.

use crate::error::{Error, Result};
use crate::watermark::Watermark;

use std::collections::HashSet;
use std::sync::Mutex;
use xxhash_rust::xxh3::xxh3_64;

/// Fingerprint of a raw key as used by the conflict window.
pub fn fingerprint(raw: &[u8]) -> u64 {
    xxh3_64(raw)
}

struct CommittedTxn {
    commit_ts: u64,
    write_fingerprints: HashSet<u64>,
}

struct OracleInner {
    next_ts: u64,
    committed: Vec<CommittedTxn>,
}

pub struct Oracle {
    inner: Mutex<OracleInner>,
    /// Serializes commit timestamp allocation with executor submission.
    /// Held across both, never across an await on the apply itself.
    commit_lock: tokio::sync::Mutex<()>,
    begin_mark: Watermark,
    commit_mark: Watermark,
}

impl std::fmt::Debug for Oracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Oracle")
            .field("begin_mark", &self.begin_mark)
            .field("commit_mark", &self.commit_mark)
            .finish()
    }
}

impl Oracle {
    /// `last_commit_ts` seeds the clock after recovery; both watermarks start
    /// at that timestamp so readers and compaction see a consistent baseline.
    pub fn new(last_commit_ts: u64) -> Self {
        let begin_mark = Watermark::new("begin");
        let commit_mark = Watermark::new("commit");
        begin_mark.begin(last_commit_ts);
        begin_mark.finish(last_commit_ts);
        commit_mark.begin(last_commit_ts);
        commit_mark.finish(last_commit_ts);
        Self {
            inner: Mutex::new(OracleInner {
                next_ts: last_commit_ts + 1,
                committed: Vec::new(),
            }),
            commit_lock: tokio::sync::Mutex::new(()),
            begin_mark,
            commit_mark,
        }
    }

    /// Allocate a read timestamp and wait until every commit at or below it
    /// has been applied to storage.
    pub async fn begin_timestamp(&self) -> Result<u64> {
        let begin_ts = {
            let inner = self
                .inner
                .lock()
                .map_err(|_| Error::InvalidState("oracle lock poisoned".to_string()))?;
            let begin_ts = inner.next_ts - 1;
            self.begin_mark.begin(begin_ts);
            begin_ts
        };
        self.commit_mark.wait_for(begin_ts).await?;
        Ok(begin_ts)
    }

    /// A transaction is done reading at its snapshot.
    pub fn done_read(&self, begin_ts: u64) {
        self.begin_mark.finish(begin_ts);
    }

    /// Take the commit lock. The caller holds the guard across
    /// [`Oracle::commit_timestamp`] and the executor submit.
    pub async fn lock_commits(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.commit_lock.lock().await
    }

    /// Check for conflicts and allocate a commit timestamp. Must be called
    /// with the commit lock held.
    pub fn commit_timestamp(
        &self,
        begin_ts: u64,
        read_fingerprints: &[u64],
        write_fingerprints: &[u64],
    ) -> Result<u64> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::InvalidState("oracle lock poisoned".to_string()))?;

        for committed in &inner.committed {
            if committed.commit_ts <= begin_ts {
                continue;
            }
            if read_fingerprints
                .iter()
                .any(|fp| committed.write_fingerprints.contains(fp))
            {
                return Err(Error::Conflict);
            }
        }

        // Entries at or below the begin watermark predate every live snapshot
        let done_till = self.begin_mark.done_till();
        inner.committed.retain(|txn| txn.commit_ts > done_till);

        let commit_ts = inner.next_ts;
        inner.next_ts += 1;
        self.commit_mark.begin(commit_ts);
        inner.committed.push(CommittedTxn {
            commit_ts,
            write_fingerprints: write_fingerprints.iter().copied().collect(),
        });
        Ok(commit_ts)
    }

    /// The batch for `commit_ts` has been applied to storage.
    pub fn done_commit(&self, commit_ts: u64) {
        self.commit_mark.finish(commit_ts);
    }

    /// No snapshot at or below this timestamp is still reading. Versions
    /// shadowed at or below it are safe to drop during compaction.
    pub fn max_begin_timestamp(&self) -> u64 {
        self.begin_mark.done_till()
    }

    pub fn close(&self) {
        self.begin_mark.close();
        self.commit_mark.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_begin_sees_only_applied_commits() {
        let oracle = Oracle::new(0);
        let ts = oracle.begin_timestamp().await.unwrap();
        assert_eq!(ts, 0);
        oracle.done_read(ts);

        let _guard = oracle.lock_commits().await;
        let commit_ts = oracle.commit_timestamp(ts, &[], &[fingerprint(b"a")]).unwrap();
        drop(_guard);
        assert_eq!(commit_ts, 1);
        oracle.done_commit(commit_ts);

        let ts = oracle.begin_timestamp().await.unwrap();
        assert_eq!(ts, 1);
        oracle.done_read(ts);
    }

    #[tokio::test]
    async fn test_conflict_on_read_of_newer_write() {
        let oracle = Oracle::new(0);
        let t1 = oracle.begin_timestamp().await.unwrap();
        let t2 = oracle.begin_timestamp().await.unwrap();
        assert_eq!(t1, t2);

        // t1 writes "shared" and commits first
        {
            let _guard = oracle.lock_commits().await;
            let commit_ts = oracle
                .commit_timestamp(t1, &[], &[fingerprint(b"shared")])
                .unwrap();
            oracle.done_commit(commit_ts);
        }
        oracle.done_read(t1);

        // t2 read "shared" under the old snapshot, so its commit conflicts
        let _guard = oracle.lock_commits().await;
        let result = oracle.commit_timestamp(
            t2,
            &[fingerprint(b"shared")],
            &[fingerprint(b"other")],
        );
        assert!(matches!(result, Err(Error::Conflict)));
        oracle.done_read(t2);
    }

    #[tokio::test]
    async fn test_disjoint_keys_do_not_conflict() {
        let oracle = Oracle::new(0);
        let t1 = oracle.begin_timestamp().await.unwrap();
        let t2 = oracle.begin_timestamp().await.unwrap();

        {
            let _guard = oracle.lock_commits().await;
            let commit_ts = oracle
                .commit_timestamp(t1, &[], &[fingerprint(b"a")])
                .unwrap();
            oracle.done_commit(commit_ts);
        }
        oracle.done_read(t1);

        let _guard = oracle.lock_commits().await;
        let commit_ts = oracle
            .commit_timestamp(t2, &[fingerprint(b"b")], &[fingerprint(b"b")])
            .unwrap();
        oracle.done_commit(commit_ts);
        oracle.done_read(t2);
        assert_eq!(commit_ts, 2);
    }

    #[tokio::test]
    async fn test_recovery_seed() {
        let oracle = Oracle::new(42);
        settle().await;
        assert_eq!(oracle.max_begin_timestamp(), 42);

        let ts = oracle.begin_timestamp().await.unwrap();
        assert_eq!(ts, 42);
        oracle.done_read(ts);
    }

    #[tokio::test]
    async fn test_max_begin_timestamp_tracks_finished_reads() {
        let oracle = Oracle::new(0);
        let t1 = oracle.begin_timestamp().await.unwrap();

        {
            let _guard = oracle.lock_commits().await;
            let commit_ts = oracle
                .commit_timestamp(t1, &[], &[fingerprint(b"a")])
                .unwrap();
            oracle.done_commit(commit_ts);
        }

        // t1 still reading at snapshot 0, so the watermark stays put
        let t2 = oracle.begin_timestamp().await.unwrap();
        assert_eq!(t2, 1);
        settle().await;
        assert_eq!(oracle.max_begin_timestamp(), 0);

        oracle.done_read(t1);
        oracle.done_read(t2);
        settle().await;
        assert_eq!(oracle.max_begin_timestamp(), 1);
    }
}
