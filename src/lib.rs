//! Embedded LSM-tree key-value storage engine with MVCC transactions.
//!
//! Writes go through serialized, conflict-checked transactions into a
//! write-ahead-logged memtable; frozen memtables flush to level-0 SSTables,
//! and a simple leveled compactor folds tables downward while garbage
//! collecting versions no snapshot can see. Readers pin a timestamp and
//! observe a consistent snapshot across every layer.
//!
//! ```no_run
//! use emberdb::{Config, Engine};
//!
//! # async fn example() -> emberdb::Result<()> {
//! let engine = Engine::open(Config::new("./data")).await?;
//! engine.put(b"consensus".to_vec(), b"raft".to_vec()).await?;
//! assert_eq!(engine.get(b"consensus").await?, Some(b"raft".to_vec()));
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod cleanup;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod iterator;
pub mod key;
pub mod manifest;
pub mod memtable;
pub mod oracle;
pub mod recovery;
pub mod scheduler;
pub mod sstable;
pub mod state;
pub mod tasks;
pub mod txn;
pub mod view;
pub mod wal;
pub mod watermark;

pub use config::{CompactionConfig, Config};
pub use engine::Engine;
pub use error::{Error, Result};
pub use txn::{ReadTransaction, Transaction};
