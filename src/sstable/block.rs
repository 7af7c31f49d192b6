//! Data blocks: the unit of SSTable reads.
//!
//! A block is a run of consecutive entries in key order. Entries are not
//! prefix compressed; lookups load one block and scan it linearly, which is
//! cheap at the default 4 KiB block size.
//!
//! # Entry Format
//!
//! ```text
//! +-----------+-------+--------+-----------+-------+
//! |raw_len:u32| raw   | ts:u64 |val_len:u32| value |
//! +-----------+-------+--------+-----------+-------+
//! ```

use crate::error::Result;
use crate::key::Key;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

pub(crate) fn encode_key(buf: &mut Vec<u8>, key: &Key) -> Result<()> {
    buf.write_u32::<BigEndian>(key.raw().len() as u32)?;
    buf.extend_from_slice(key.raw());
    buf.write_u64::<BigEndian>(key.timestamp())?;
    Ok(())
}

pub(crate) fn decode_key(reader: &mut impl Read) -> Result<Key> {
    let raw_len = reader.read_u32::<BigEndian>()? as usize;
    let mut raw = vec![0u8; raw_len];
    reader.read_exact(&mut raw)?;
    let timestamp = reader.read_u64::<BigEndian>()?;
    Ok(Key::new(raw, timestamp))
}

/// Accumulates sorted entries into one encoded block.
#[derive(Debug, Default)]
pub struct BlockBuilder {
    data: Vec<u8>,
    first_key: Option<Key>,
    count: usize,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &Key, value: &[u8]) -> Result<()> {
        if self.first_key.is_none() {
            self.first_key = Some(key.clone());
        }
        encode_key(&mut self.data, key)?;
        self.data.write_u32::<BigEndian>(value.len() as u32)?;
        self.data.extend_from_slice(value);
        self.count += 1;
        Ok(())
    }

    /// Encoded size so far, used to decide when to cut the block.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Finish the block, returning its first key and encoded bytes.
    pub fn build(self) -> (Key, Vec<u8>) {
        let first_key = self
            .first_key
            .unwrap_or_else(|| Key::new(Vec::new(), 0));
        (first_key, self.data)
    }
}

/// A decoded block held in memory.
#[derive(Debug)]
pub struct Block {
    data: Vec<u8>,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn iter(&self) -> BlockIterator<'_> {
        BlockIterator {
            cursor: &self.data,
        }
    }

    /// Decode every entry at once.
    pub fn entries(&self) -> Result<Vec<(Key, Vec<u8>)>> {
        self.iter().collect()
    }
}

pub struct BlockIterator<'a> {
    cursor: &'a [u8],
}

impl Iterator for BlockIterator<'_> {
    type Item = Result<(Key, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.is_empty() {
            return None;
        }
        let result = (|| {
            let key = decode_key(&mut self.cursor)?;
            let value_len = self.cursor.read_u32::<BigEndian>()? as usize;
            let mut value = vec![0u8; value_len];
            self.cursor.read_exact(&mut value)?;
            Ok((key, value))
        })();
        Some(result)
    }
}
