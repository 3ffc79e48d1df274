//! Per-block bloom filters.
//!
//! Each SSTable carries up to two filter blocks: the primary filter over
//! user keys and the secondary filter over composite keys
//! (`secondary_value || tag`) plus the bare secondary value. Both map a data
//! block's starting file offset to one bloom filter built from the keys
//! added while that block was current, so the read path can skip a block
//! without opening it.
//!
//! The bloom itself uses FNV-1a double hashing: `h(i) = h1 + i * h2`.

use std::collections::HashMap;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::Error;

/// Name advertised in the metaindex entries (`filter.<name>`,
/// `secondaryfilter.<name>`).
pub const FILTER_POLICY_NAME: &str = "fnv-bloom";

/// A bloom filter over a fixed key set.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Builds a filter sized at `bits_per_key` bits per key.
    pub fn build(keys: &[Vec<u8>], bits_per_key: usize) -> Self {
        let num_bits = (keys.len() * bits_per_key).max(64) as u64;
        // k = bits_per_key * ln(2), clamped to a sane range.
        let num_hashes = ((bits_per_key as f64 * std::f64::consts::LN_2) as u32).clamp(1, 30);

        let mut filter = Self {
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
            num_bits,
            num_hashes,
        };
        for key in keys {
            filter.insert(key);
        }
        filter
    }

    fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = bit_index(h1, h2, i, self.num_bits);
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    /// True if the key may be in the set; false means definitely not.
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = bit_index(h1, h2, i, self.num_bits);
            if (self.bits[(idx / 8) as usize] >> (idx % 8)) & 1 == 0 {
                return false;
            }
        }
        true
    }
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    (
        fnv1a_64(key, 0xcbf29ce484222325),
        fnv1a_64(key, 0x517cc1b727220a95),
    )
}

fn bit_index(h1: u64, h2: u64, i: u32, num_bits: u64) -> u64 {
    h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits
}

/// FNV-1a 64-bit hash with a configurable starting basis.
fn fnv1a_64(data: &[u8], basis: u64) -> u64 {
    const FNV_PRIME: u64 = 0x00000100000001b3;
    let mut hash = basis;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Accumulates keys per data block and serializes one filter per block
/// offset.
pub struct FilterBlockBuilder {
    bits_per_key: usize,
    current_offset: u64,
    pending_keys: Vec<Vec<u8>>,
    filters: Vec<(u64, BloomFilter)>,
}

impl FilterBlockBuilder {
    pub fn new(bits_per_key: usize) -> Self {
        Self {
            bits_per_key,
            current_offset: 0,
            pending_keys: Vec::new(),
            filters: Vec::new(),
        }
    }

    /// Closes the filter for the block that just ended and starts
    /// accumulating for the block beginning at `offset`.
    pub fn start_block(&mut self, offset: u64) {
        if !self.pending_keys.is_empty() {
            let filter = BloomFilter::build(&self.pending_keys, self.bits_per_key);
            self.filters.push((self.current_offset, filter));
            self.pending_keys.clear();
        }
        self.current_offset = offset;
    }

    pub fn add_key(&mut self, key: Vec<u8>) {
        self.pending_keys.push(key);
    }

    /// Serializes the filter block:
    /// `count:u32 || (offset:u64, num_bits:u64, num_hashes:u32, bits_len:u32, bits)*`.
    pub fn finish(mut self) -> Vec<u8> {
        // Flush the trailing block's keys.
        if !self.pending_keys.is_empty() {
            let filter = BloomFilter::build(&self.pending_keys, self.bits_per_key);
            self.filters.push((self.current_offset, filter));
        }

        let mut buffer = Vec::new();
        buffer
            .write_u32::<BigEndian>(self.filters.len() as u32)
            .unwrap();
        for (offset, filter) in &self.filters {
            buffer.write_u64::<BigEndian>(*offset).unwrap();
            buffer.write_u64::<BigEndian>(filter.num_bits).unwrap();
            buffer.write_u32::<BigEndian>(filter.num_hashes).unwrap();
            buffer
                .write_u32::<BigEndian>(filter.bits.len() as u32)
                .unwrap();
            buffer.extend_from_slice(&filter.bits);
        }
        buffer
    }
}

/// Read-side filter block: block offset -> bloom filter.
pub struct FilterBlockReader {
    filters: HashMap<u64, BloomFilter>,
}

impl FilterBlockReader {
    pub fn new(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let count = cursor.read_u32::<BigEndian>()?;

        let mut filters = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let offset = cursor.read_u64::<BigEndian>()?;
            let num_bits = cursor.read_u64::<BigEndian>()?;
            let num_hashes = cursor.read_u32::<BigEndian>()?;
            let bits_len = cursor.read_u32::<BigEndian>()? as usize;

            let pos = cursor.position() as usize;
            if pos + bits_len > data.len() || num_bits == 0 {
                return Err(Error::Corruption("filter block truncated".to_string()));
            }
            let bits = data[pos..pos + bits_len].to_vec();
            cursor.set_position((pos + bits_len) as u64);

            filters.insert(
                offset,
                BloomFilter {
                    bits,
                    num_bits,
                    num_hashes,
                },
            );
        }
        Ok(Self { filters })
    }

    /// True if the key may be present in the block at `offset`. A block with
    /// no recorded filter never excludes.
    pub fn key_may_match(&self, offset: u64, key: &[u8]) -> bool {
        match self.filters.get(&offset) {
            Some(filter) => filter.may_contain(key),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_no_false_negatives() {
        let keys: Vec<Vec<u8>> = (0..100).map(|i| format!("key-{i}").into_bytes()).collect();
        let filter = BloomFilter::build(&keys, 10);
        for key in &keys {
            assert!(filter.may_contain(key));
        }
    }

    #[test]
    fn test_bloom_rejects_most_absent_keys() {
        let keys: Vec<Vec<u8>> = (0..100).map(|i| format!("key-{i}").into_bytes()).collect();
        let filter = BloomFilter::build(&keys, 10);

        let false_positives = (0..1000)
            .filter(|i| filter.may_contain(format!("absent-{i}").as_bytes()))
            .count();
        // ~1% expected at 10 bits/key; anything under 5% is healthy.
        assert!(false_positives < 50, "{false_positives} false positives");
    }

    #[test]
    fn test_filter_block_roundtrip() {
        let mut builder = FilterBlockBuilder::new(10);
        builder.start_block(0);
        builder.add_key(b"alpha".to_vec());
        builder.add_key(b"beta".to_vec());
        builder.start_block(4096);
        builder.add_key(b"gamma".to_vec());

        let reader = FilterBlockReader::new(&builder.finish()).unwrap();

        assert!(reader.key_may_match(0, b"alpha"));
        assert!(reader.key_may_match(0, b"beta"));
        assert!(reader.key_may_match(4096, b"gamma"));
        assert!(!reader.key_may_match(4096, b"alpha"));
        // No filter recorded for an unknown offset: never exclude.
        assert!(reader.key_may_match(8192, b"anything"));
    }

    #[test]
    fn test_empty_block_skipped() {
        let mut builder = FilterBlockBuilder::new(10);
        builder.start_block(0);
        builder.start_block(4096);
        builder.add_key(b"only".to_vec());
        let reader = FilterBlockReader::new(&builder.finish()).unwrap();
        assert!(reader.key_may_match(4096, b"only"));
    }

    #[test]
    fn test_corrupt_filter_block() {
        assert!(FilterBlockReader::new(&[0, 0]).is_err());
        // Count says one filter but no body follows.
        assert!(FilterBlockReader::new(&[0, 0, 0, 1]).is_err());
    }
}
