//! Append-only manifest of structural changes.
//!
//! Every change to the shape of the store (a memtable created, a memtable
//! flushed to level 0, a compaction) appends one event here before the
//! in-memory state flips. Replaying the manifest from the start reproduces
//! the exact layout: which memtables are live, which table ids sit in which
//! level, and the next free ids.
//!
//! # Record Format
//!
//! ```text
//! +--------+---------+-----------+
//! | tag:u8 | payload | crc32:u32 |
//! +--------+---------+-----------+
//! ```
//!
//! The CRC covers the tag and payload. Integers are big-endian.

use crate::error::{Error, Result};
use crate::wal::CRC32;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const TAG_MEMTABLE_CREATED: u8 = 1;
const TAG_SST_FLUSHED: u8 = 2;
const TAG_COMPACTION_DONE: u8 = 3;

/// One structural change to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A new active memtable was created with this id.
    MemtableCreated { id: u64 },
    /// A frozen memtable was flushed into a level-0 table.
    SstFlushed { memtable_id: u64, sst_id: u64 },
    /// A compaction replaced tables in two adjacent levels.
    /// `upper_level` is -1 when the upper level is level 0.
    CompactionDone {
        upper_level: i32,
        lower_level: u32,
        consumed: Vec<u64>,
        produced: Vec<u64>,
    },
}

impl Event {
    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Event::MemtableCreated { id } => {
                buf.write_u8(TAG_MEMTABLE_CREATED)?;
                buf.write_u64::<BigEndian>(*id)?;
            }
            Event::SstFlushed {
                memtable_id,
                sst_id,
            } => {
                buf.write_u8(TAG_SST_FLUSHED)?;
                buf.write_u64::<BigEndian>(*memtable_id)?;
                buf.write_u64::<BigEndian>(*sst_id)?;
            }
            Event::CompactionDone {
                upper_level,
                lower_level,
                consumed,
                produced,
            } => {
                buf.write_u8(TAG_COMPACTION_DONE)?;
                buf.write_i32::<BigEndian>(*upper_level)?;
                buf.write_u32::<BigEndian>(*lower_level)?;
                buf.write_u32::<BigEndian>(consumed.len() as u32)?;
                for id in consumed {
                    buf.write_u64::<BigEndian>(*id)?;
                }
                buf.write_u32::<BigEndian>(produced.len() as u32)?;
                for id in produced {
                    buf.write_u64::<BigEndian>(*id)?;
                }
            }
        }
        let checksum = CRC32.checksum(&buf);
        buf.write_u32::<BigEndian>(checksum)?;
        Ok(buf)
    }

    fn decode(reader: &mut impl Read) -> Result<Option<Self>> {
        let mut body = Vec::new();
        let tag = match reader.read_u8() {
            Ok(tag) => tag,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        body.push(tag);

        let event = match tag {
            TAG_MEMTABLE_CREATED => {
                let id = read_u64(reader, &mut body)?;
                Event::MemtableCreated { id }
            }
            TAG_SST_FLUSHED => {
                let memtable_id = read_u64(reader, &mut body)?;
                let sst_id = read_u64(reader, &mut body)?;
                Event::SstFlushed {
                    memtable_id,
                    sst_id,
                }
            }
            TAG_COMPACTION_DONE => {
                let upper_level = read_i32(reader, &mut body)?;
                let lower_level = read_u32(reader, &mut body)?;
                let consumed_len = read_u32(reader, &mut body)? as usize;
                let mut consumed = Vec::with_capacity(consumed_len);
                for _ in 0..consumed_len {
                    consumed.push(read_u64(reader, &mut body)?);
                }
                let produced_len = read_u32(reader, &mut body)? as usize;
                let mut produced = Vec::with_capacity(produced_len);
                for _ in 0..produced_len {
                    produced.push(read_u64(reader, &mut body)?);
                }
                Event::CompactionDone {
                    upper_level,
                    lower_level,
                    consumed,
                    produced,
                }
            }
            other => {
                return Err(Error::Corruption(format!(
                    "unknown manifest event tag {}",
                    other
                )))
            }
        };

        let stored_crc = reader.read_u32::<BigEndian>()?;
        if CRC32.checksum(&body) != stored_crc {
            return Err(Error::ChecksumMismatch);
        }
        Ok(Some(event))
    }
}

fn read_u64(reader: &mut impl Read, body: &mut Vec<u8>) -> Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    body.extend_from_slice(&bytes);
    Ok(u64::from_be_bytes(bytes))
}

fn read_u32(reader: &mut impl Read, body: &mut Vec<u8>) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    body.extend_from_slice(&bytes);
    Ok(u32::from_be_bytes(bytes))
}

fn read_i32(reader: &mut impl Read, body: &mut Vec<u8>) -> Result<i32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    body.extend_from_slice(&bytes);
    Ok(i32::from_be_bytes(bytes))
}

pub struct Manifest {
    file: Mutex<File>,
    path: PathBuf,
}

impl std::fmt::Debug for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifest").field("path", &self.path).finish()
    }
}

impl Manifest {
    /// Create a fresh manifest for a new store.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Open an existing manifest, returning it alongside the replayed events.
    pub fn recover(path: impl AsRef<Path>) -> Result<(Self, Vec<Event>)> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = Event::decode(&mut reader)? {
            events.push(event);
        }

        let file = OpenOptions::new().append(true).open(path.as_ref())?;
        Ok((
            Self {
                file: Mutex::new(file),
                path: path.as_ref().to_path_buf(),
            },
            events,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event and fsync before returning.
    pub fn append(&self, event: &Event) -> Result<()> {
        let record = event.encode()?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| Error::InvalidState("manifest lock poisoned".to_string()))?;
        file.write_all(&record)?;
        file.sync_all()?;
        Ok(())
    }
}
