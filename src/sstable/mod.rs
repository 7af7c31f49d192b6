//! Immutable sorted string tables.
//!
//! An SSTable is the on-disk unit of the engine: a sequence of sorted data
//! blocks followed by a block index, a bloom filter over raw keys, and a
//! metadata footer. Tables are written once by flush or compaction and never
//! modified; superseded tables are deleted by the cleanup task once no
//! iterator holds them.

mod block;
mod bloom;
mod table;

pub use block::{Block, BlockBuilder};
pub use bloom::Bloom;
pub use table::{Sst, SstBuilder, SstIterator};
