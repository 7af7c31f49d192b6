//! Watermarks over begun and committed timestamps.
//!
//! A watermark tracks a set of in-flight timestamps and exposes `done_till`:
//! the highest timestamp T such that every timestamp at or below T has been
//! finished. Advancement is strictly prefix-ordered, so a single slow
//! participant holds the watermark back.
//!
//! The oracle runs two of these. The begin watermark (over read timestamps)
//! tells compaction which versions are safe to drop and bounds conflict
//! window pruning. The commit watermark (over commit timestamps) lets a new
//! transaction wait until every commit it might observe has been applied.
//!
//! All bookkeeping lives in one task fed by an unbounded channel, so begin
//! and finish are cheap sends and never contend on a shared heap.

use crate::error::{Error, Result};

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};

struct Mark {
    ts: u64,
    done: bool,
    waiter: Option<oneshot::Sender<()>>,
}

pub struct Watermark {
    name: &'static str,
    tx: RwLock<Option<mpsc::UnboundedSender<Mark>>>,
    done_till: Arc<AtomicU64>,
}

impl std::fmt::Debug for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watermark")
            .field("name", &self.name)
            .field("done_till", &self.done_till())
            .finish()
    }
}

impl Watermark {
    /// Spawn the bookkeeping task. Must be called inside a tokio runtime.
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let done_till = Arc::new(AtomicU64::new(0));
        tokio::spawn(process(name, rx, Arc::clone(&done_till)));
        Self {
            name,
            tx: RwLock::new(Some(tx)),
            done_till,
        }
    }

    /// Register `ts` as in flight.
    pub fn begin(&self, ts: u64) {
        self.send(Mark {
            ts,
            done: false,
            waiter: None,
        });
    }

    /// Mark one in-flight registration of `ts` as finished.
    pub fn finish(&self, ts: u64) {
        self.send(Mark {
            ts,
            done: true,
            waiter: None,
        });
    }

    /// Highest timestamp with no unfinished registration at or below it.
    pub fn done_till(&self) -> u64 {
        self.done_till.load(Ordering::SeqCst)
    }

    /// Wait until `done_till` reaches `ts`.
    pub async fn wait_for(&self, ts: u64) -> Result<()> {
        if self.done_till() >= ts {
            return Ok(());
        }
        let (waiter_tx, waiter_rx) = oneshot::channel();
        {
            let tx = self
                .tx
                .read()
                .map_err(|_| Error::InvalidState("watermark lock poisoned".to_string()))?;
            let tx = tx.as_ref().ok_or(Error::WatermarkClosed)?;
            tx.send(Mark {
                ts,
                done: false,
                waiter: Some(waiter_tx),
            })
            .map_err(|_| Error::WatermarkClosed)?;
        }
        waiter_rx.await.map_err(|_| Error::WatermarkClosed)
    }

    /// Stop the bookkeeping task. Pending waiters observe
    /// [`Error::WatermarkClosed`].
    pub fn close(&self) {
        if let Ok(mut tx) = self.tx.write() {
            tx.take();
        }
    }

    fn send(&self, mark: Mark) {
        if let Ok(tx) = self.tx.read() {
            if let Some(tx) = tx.as_ref() {
                // A send failure means close() raced us; the engine is
                // shutting down and the mark no longer matters.
                let _ = tx.send(mark);
            }
        }
    }
}

async fn process(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<Mark>,
    done_till: Arc<AtomicU64>,
) {
    let mut heap: BinaryHeap<Reverse<u64>> = BinaryHeap::new();
    let mut pending: HashMap<u64, i64> = HashMap::new();
    let mut waiters: HashMap<u64, Vec<oneshot::Sender<()>>> = HashMap::new();

    while let Some(mark) = rx.recv().await {
        if let Some(waiter) = mark.waiter {
            if done_till.load(Ordering::SeqCst) >= mark.ts {
                let _ = waiter.send(());
            } else {
                waiters.entry(mark.ts).or_default().push(waiter);
            }
            continue;
        }

        let delta = if mark.done { -1 } else { 1 };
        match pending.get_mut(&mark.ts) {
            Some(count) => *count += delta,
            None => {
                heap.push(Reverse(mark.ts));
                pending.insert(mark.ts, delta);
            }
        }

        // Advance past every fully finished prefix of timestamps
        let mut until = done_till.load(Ordering::SeqCst);
        while let Some(Reverse(ts)) = heap.peek().copied() {
            match pending.get(&ts) {
                Some(0) => {
                    heap.pop();
                    pending.remove(&ts);
                    until = until.max(ts);
                }
                Some(_) => break,
                None => {
                    heap.pop();
                }
            }
        }

        if until > done_till.load(Ordering::SeqCst) {
            done_till.store(until, Ordering::SeqCst);
            waiters.retain(|ts, senders| {
                if *ts <= until {
                    for sender in senders.drain(..) {
                        let _ = sender.send(());
                    }
                    false
                } else {
                    true
                }
            });
        }
    }
    tracing::trace!(watermark = name, "watermark task stopped");
}
