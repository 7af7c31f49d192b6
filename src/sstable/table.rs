//! SSTable writer and reader.
//!
//! # File Layout
//!
//! ```text
//! +----------+----------+-----+------------+-------+-------+--------+
//! | block 0  | block 1  | ... | block n-1  | index | bloom | footer |
//! +----------+----------+-----+------------+-------+-------+--------+
//! ```
//!
//! The index maps each block's first key to its byte range. The footer holds
//! the offsets of the index and bloom regions plus table metadata (last key,
//! max timestamp, entry count), and is read first when a table is opened.

use crate::error::{Error, Result};
use crate::key::Key;
use crate::sstable::block::{decode_key, encode_key, Block, BlockBuilder};
use crate::sstable::Bloom;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct IndexEntry {
    first_key: Key,
    offset: u64,
    len: u64,
}

/// Streams sorted entries into a new table file.
pub struct SstBuilder {
    id: u64,
    path: PathBuf,
    block_size: usize,
    data: Vec<u8>,
    index: Vec<IndexEntry>,
    current: BlockBuilder,
    raw_keys: Vec<Vec<u8>>,
    first_key: Option<Key>,
    last_key: Option<Key>,
    max_ts: u64,
    entry_count: u64,
}

impl SstBuilder {
    pub fn new(id: u64, path: impl AsRef<Path>, block_size: usize) -> Self {
        Self {
            id,
            path: path.as_ref().to_path_buf(),
            block_size,
            data: Vec::new(),
            index: Vec::new(),
            current: BlockBuilder::new(),
            raw_keys: Vec::new(),
            first_key: None,
            last_key: None,
            max_ts: 0,
            entry_count: 0,
        }
    }

    /// Append one entry. Keys must arrive in ascending [`Key`] order.
    pub fn add(&mut self, key: Key, value: Vec<u8>) -> Result<()> {
        if !self.current.is_empty() && self.current.size() >= self.block_size {
            self.cut_block();
        }
        if self.first_key.is_none() {
            self.first_key = Some(key.clone());
        }
        // Input is sorted, so consecutive versions of a raw key dedupe here
        if self.raw_keys.last().map(|k| k.as_slice()) != Some(key.raw()) {
            self.raw_keys.push(key.raw().to_vec());
        }
        self.max_ts = self.max_ts.max(key.timestamp());
        self.entry_count += 1;
        self.last_key = Some(key.clone());
        self.current.add(&key, &value)
    }

    /// Bytes of block data accumulated so far. Compaction uses this to split
    /// its output into tables of roughly the configured size.
    pub fn estimated_size(&self) -> usize {
        self.data.len() + self.current.size()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    fn cut_block(&mut self) {
        let builder = std::mem::take(&mut self.current);
        let (first_key, bytes) = builder.build();
        self.index.push(IndexEntry {
            first_key,
            offset: self.data.len() as u64,
            len: bytes.len() as u64,
        });
        self.data.extend_from_slice(&bytes);
    }

    /// Write the table file and open it for reading.
    pub fn finish(mut self) -> Result<Arc<Sst>> {
        if self.entry_count == 0 {
            return Err(Error::InvalidState(
                "refusing to write an empty table".to_string(),
            ));
        }
        if !self.current.is_empty() {
            self.cut_block();
        }

        let mut bloom = Bloom::new(self.raw_keys.len());
        for raw in &self.raw_keys {
            bloom.insert(raw);
        }

        let mut buf = self.data;
        let index_offset = buf.len() as u64;
        buf.write_u32::<BigEndian>(self.index.len() as u32)?;
        for entry in &self.index {
            encode_key(&mut buf, &entry.first_key)?;
            buf.write_u64::<BigEndian>(entry.offset)?;
            buf.write_u64::<BigEndian>(entry.len)?;
        }

        let bloom_offset = buf.len() as u64;
        bloom.encode(&mut buf)?;

        let meta_offset = buf.len() as u64;
        // first_key is Some whenever entry_count > 0
        let last_key = self
            .last_key
            .clone()
            .ok_or_else(|| Error::InvalidState("table without last key".to_string()))?;
        encode_key(&mut buf, &last_key)?;
        buf.write_u64::<BigEndian>(self.max_ts)?;
        buf.write_u64::<BigEndian>(self.entry_count)?;

        buf.write_u64::<BigEndian>(index_offset)?;
        buf.write_u64::<BigEndian>(bloom_offset)?;
        buf.write_u64::<BigEndian>(meta_offset)?;

        let mut file = File::create(&self.path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        drop(file);

        Sst::open(self.id, &self.path)
    }
}

/// An immutable table open for reads.
pub struct Sst {
    id: u64,
    path: PathBuf,
    file: File,
    index: Vec<IndexEntry>,
    bloom: Bloom,
    first_key: Key,
    last_key: Key,
    size: u64,
    entry_count: u64,
    max_ts: u64,
}

impl std::fmt::Debug for Sst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sst")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("entry_count", &self.entry_count)
            .finish()
    }
}

impl Sst {
    pub fn open(id: u64, path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        if size < 24 {
            return Err(Error::Corruption(format!(
                "table {} too short: {} bytes",
                id, size
            )));
        }

        let mut footer = [0u8; 24];
        file.read_exact_at(&mut footer, size - 24)?;
        let mut cursor = &footer[..];
        let index_offset = cursor.read_u64::<BigEndian>()?;
        let bloom_offset = cursor.read_u64::<BigEndian>()?;
        let meta_offset = cursor.read_u64::<BigEndian>()?;
        if index_offset > bloom_offset || bloom_offset > meta_offset || meta_offset > size - 24 {
            return Err(Error::Corruption(format!("table {} footer malformed", id)));
        }

        let mut tail = vec![0u8; (size - 24 - index_offset) as usize];
        file.read_exact_at(&mut tail, index_offset)?;

        let mut cursor = &tail[..(bloom_offset - index_offset) as usize];
        let block_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut index = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            let first_key = decode_key(&mut cursor)?;
            let offset = cursor.read_u64::<BigEndian>()?;
            let len = cursor.read_u64::<BigEndian>()?;
            index.push(IndexEntry {
                first_key,
                offset,
                len,
            });
        }
        if index.is_empty() {
            return Err(Error::Corruption(format!("table {} has no blocks", id)));
        }

        let bloom =
            Bloom::decode(&tail[(bloom_offset - index_offset) as usize..])?;

        let mut cursor = &tail[(meta_offset - index_offset) as usize..];
        let last_key = decode_key(&mut cursor)?;
        let max_ts = cursor.read_u64::<BigEndian>()?;
        let entry_count = cursor.read_u64::<BigEndian>()?;

        let first_key = index[0].first_key.clone();
        Ok(Arc::new(Self {
            id,
            path,
            file,
            index,
            bloom,
            first_key,
            last_key,
            size,
            entry_count,
            max_ts,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Highest commit timestamp stored in this table.
    pub fn max_ts(&self) -> u64 {
        self.max_ts
    }

    pub fn first_key(&self) -> &Key {
        &self.first_key
    }

    pub fn last_key(&self) -> &Key {
        &self.last_key
    }

    /// Cheap pre-check for point lookups: key range plus bloom filter.
    pub fn may_contain(&self, raw: &[u8]) -> bool {
        if raw < self.first_key.raw() || raw > self.last_key.raw() {
            return false;
        }
        self.bloom.may_contain(raw)
    }

    fn read_block(&self, idx: usize) -> Result<Block> {
        let entry = &self.index[idx];
        let mut data = vec![0u8; entry.len as usize];
        self.file.read_exact_at(&mut data, entry.offset)?;
        Ok(Block::new(data))
    }

    /// Iterator over the whole table in key order.
    pub fn iter(self: &Arc<Self>) -> SstIterator {
        SstIterator {
            table: Arc::clone(self),
            next_block: 0,
            entries: Vec::new().into_iter(),
            pending: None,
        }
    }

    /// Iterator positioned at the first entry at or after `key`.
    pub fn seek(self: &Arc<Self>, key: &Key) -> SstIterator {
        let idx = self.index.partition_point(|e| e.first_key <= *key);
        let start = idx.saturating_sub(1);
        SstIterator {
            table: Arc::clone(self),
            next_block: start,
            entries: Vec::new().into_iter(),
            pending: Some(key.clone()),
        }
    }

    /// Newest version of `raw` at or below `read_ts`, tombstones included.
    pub fn get(self: &Arc<Self>, raw: &[u8], read_ts: u64) -> Result<Option<Vec<u8>>> {
        if !self.may_contain(raw) {
            return Ok(None);
        }
        let target = Key::new(raw.to_vec(), read_ts);
        for item in self.seek(&target) {
            let (key, value) = item?;
            return if key.raw() == raw {
                Ok(Some(value))
            } else {
                Ok(None)
            };
        }
        Ok(None)
    }
}

/// Streaming reader over one table. Holds the table `Arc`, which keeps the
/// file alive even after compaction removes the table from the live set.
pub struct SstIterator {
    table: Arc<Sst>,
    next_block: usize,
    entries: std::vec::IntoIter<(Key, Vec<u8>)>,
    /// Seek target; entries before it are skipped once.
    pending: Option<Key>,
}

impl Iterator for SstIterator {
    type Item = Result<(Key, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((key, value)) = self.entries.next() {
                if let Some(target) = &self.pending {
                    if key < *target {
                        continue;
                    }
                    self.pending = None;
                }
                return Some(Ok((key, value)));
            }
            if self.next_block >= self.table.index.len() {
                return None;
            }
            let block = match self.table.read_block(self.next_block) {
                Ok(block) => block,
                Err(e) => {
                    self.next_block = self.table.index.len();
                    return Some(Err(e));
                }
            };
            self.next_block += 1;
            match block.entries() {
                Ok(entries) => self.entries = entries.into_iter(),
                Err(e) => {
                    self.next_block = self.table.index.len();
                    return Some(Err(e));
                }
            }
        }
    }
}
