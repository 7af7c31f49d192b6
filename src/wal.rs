//! Per-memtable write-ahead log.
//!
//! Each memtable owns one append-only log file. Committed batch entries are
//! appended before they are inserted into the memtable, and the file is
//! removed once the memtable has been flushed to an SSTable. On startup the
//! log is replayed in append order to rebuild the memtable contents and to
//! recover the highest commit timestamp it contains.
//!
//! # Record Format
//!
//! ```text
//! +-----------+-------+--------+-----------+-------+-----------+
//! |key_len:u32| key   | ts:u64 |val_len:u32| value | crc32:u32 |
//! +-----------+-------+--------+-----------+-------+-----------+
//! ```
//!
//! All integers are big-endian. The CRC32 covers every preceding byte of the
//! record. A zero-length value is a tombstone.

use crate::error::{Error, Result};
use crate::key::Key;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub struct Wal {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal").field("path", &self.path).finish()
    }
}

impl Wal {
    /// Create a fresh log file, truncating anything already at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one versioned entry. The write is buffered; call [`Wal::sync`]
    /// to force it to disk.
    pub fn append(&self, key: &Key, value: &[u8]) -> Result<()> {
        let mut record = Vec::with_capacity(key.raw().len() + value.len() + 20);
        record.write_u32::<BigEndian>(key.raw().len() as u32)?;
        record.write_all(key.raw())?;
        record.write_u64::<BigEndian>(key.timestamp())?;
        record.write_u32::<BigEndian>(value.len() as u32)?;
        record.write_all(value)?;
        let checksum = CRC32.checksum(&record);
        record.write_u32::<BigEndian>(checksum)?;

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::InvalidState("WAL writer lock poisoned".to_string()))?;
        writer.write_all(&record)?;
        Ok(())
    }

    /// Flush buffered records and fsync the file.
    pub fn sync(&self) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::InvalidState("WAL writer lock poisoned".to_string()))?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Replay an existing log, returning entries in append order.
    pub fn replay(path: impl AsRef<Path>) -> Result<Vec<(Key, Vec<u8>)>> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();

        loop {
            let key_len = match reader.read_u32::<BigEndian>() {
                Ok(len) => len as usize,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            let mut raw = vec![0u8; key_len];
            reader.read_exact(&mut raw)?;
            let timestamp = reader.read_u64::<BigEndian>()?;
            let value_len = reader.read_u32::<BigEndian>()? as usize;
            let mut value = vec![0u8; value_len];
            reader.read_exact(&mut value)?;
            let stored_crc = reader.read_u32::<BigEndian>()?;

            let mut record = Vec::with_capacity(key_len + value_len + 16);
            record.write_u32::<BigEndian>(key_len as u32)?;
            record.write_all(&raw)?;
            record.write_u64::<BigEndian>(timestamp)?;
            record.write_u32::<BigEndian>(value_len as u32)?;
            record.write_all(&value)?;
            if CRC32.checksum(&record) != stored_crc {
                return Err(Error::ChecksumMismatch);
            }

            entries.push((Key::new(raw, timestamp), value));
        }

        Ok(entries)
    }
}
