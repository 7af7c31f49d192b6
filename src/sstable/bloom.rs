//! Bloom filter over the raw keys of one SSTable.
//!
//! Point lookups consult the filter before touching any data block, so a
//! table that cannot contain a key costs no block read. Sized for roughly a
//! 1% false positive rate at build time.

use crate::error::{Error, Result};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use xxhash_rust::xxh3::xxh3_128;

const BITS_PER_KEY: f64 = 10.0;
const MIN_BITS: usize = 64;

#[derive(Debug, Clone)]
pub struct Bloom {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: u32,
}

impl Bloom {
    /// Allocate a filter sized for `expected_keys` entries.
    pub fn new(expected_keys: usize) -> Self {
        let num_bits = ((expected_keys as f64 * BITS_PER_KEY) as usize).max(MIN_BITS);
        let num_hashes = ((BITS_PER_KEY * 0.69) as u32).max(1);
        Self {
            bits: vec![0u64; num_bits.div_ceil(64)],
            num_bits,
            num_hashes,
        }
    }

    /// Double hashing over the two halves of one 128-bit hash.
    fn probes(&self, raw: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let hash = xxh3_128(raw);
        let h1 = hash as u64;
        let h2 = (hash >> 64) as u64;
        let num_bits = self.num_bits as u64;
        (0..self.num_hashes as u64)
            .map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % num_bits) as usize)
    }

    pub fn insert(&mut self, raw: &[u8]) {
        let positions: Vec<usize> = self.probes(raw).collect();
        for pos in positions {
            self.bits[pos / 64] |= 1 << (pos % 64);
        }
    }

    /// False means the key is definitely absent from the table.
    pub fn may_contain(&self, raw: &[u8]) -> bool {
        let mut probes = self.probes(raw);
        probes.all(|pos| self.bits[pos / 64] & (1 << (pos % 64)) != 0)
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u64::<BigEndian>(self.num_bits as u64)?;
        buf.write_u32::<BigEndian>(self.num_hashes)?;
        buf.write_u32::<BigEndian>(self.bits.len() as u32)?;
        for word in &self.bits {
            buf.write_u64::<BigEndian>(*word)?;
        }
        Ok(())
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let num_bits = buf.read_u64::<BigEndian>()? as usize;
        let num_hashes = buf.read_u32::<BigEndian>()?;
        let num_words = buf.read_u32::<BigEndian>()? as usize;
        if num_hashes == 0 || num_words != num_bits.div_ceil(64) {
            return Err(Error::Corruption("malformed bloom filter".to_string()));
        }
        let mut bits = Vec::with_capacity(num_words);
        for _ in 0..num_words {
            bits.push(buf.read_u64::<BigEndian>()?);
        }
        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }

    pub fn encoded_size(&self) -> usize {
        16 + self.bits.len() * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserted_keys_are_found() {
        let mut bloom = Bloom::new(100);
        for i in 0..100u32 {
            bloom.insert(format!("key-{i}").as_bytes());
        }
        for i in 0..100u32 {
            assert!(bloom.may_contain(format!("key-{i}").as_bytes()));
        }
    }

    #[test]
    fn test_absent_keys_mostly_rejected() {
        let mut bloom = Bloom::new(100);
        for i in 0..100u32 {
            bloom.insert(format!("key-{i}").as_bytes());
        }
        let false_positives = (0..1000u32)
            .filter(|i| bloom.may_contain(format!("other-{i}").as_bytes()))
            .count();
        // 10 bits per key gives roughly 1% false positives
        assert!(false_positives < 100, "too many false positives: {false_positives}");
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut bloom = Bloom::new(50);
        bloom.insert(b"consensus");
        bloom.insert(b"storage");

        let mut buf = Vec::new();
        bloom.encode(&mut buf).unwrap();
        let decoded = Bloom::decode(&buf).unwrap();

        assert!(decoded.may_contain(b"consensus"));
        assert!(decoded.may_contain(b"storage"));
        assert_eq!(decoded.num_bits, bloom.num_bits);
        assert_eq!(decoded.num_hashes, bloom.num_hashes);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Bloom::decode(&[0u8; 4]).is_err());
    }
}
