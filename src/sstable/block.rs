//! Prefix-compressed key/value blocks.
//!
//! Every block section of an SSTable (data, index, metaindex, interval)
//! shares one format: entries with a shared-prefix length against the
//! previous key, a restart-point array for binary search, and a trailing
//! restart count.
//!
//! ```text
//! +---------+-----------+-----------+------------+-------+
//! |shared:u16|unshared:u16|value_len:u32|key suffix| value |  (per entry)
//! +---------+-----------+-----------+------------+-------+
//! | restart positions: u32 * n | restart count: u32 |
//! +--------------------------------------------------+
//! ```
//!
//! Data blocks use a restart interval of 16. The index, metaindex, and
//! interval blocks use an interval of 1 so every key is self-contained.

use std::{cmp::Ordering, io, sync::Arc};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::Error;

/// Restart interval for data blocks.
pub const DATA_RESTART_INTERVAL: usize = 16;

pub struct Builder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    restart_interval: usize,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl Builder {
    pub fn new(restart_interval: usize) -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            restart_interval: restart_interval.max(1),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, key: &[u8], value: &[u8]) {
        let shared_prefix_len = if self.entry_count % self.restart_interval == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_length(&self.last_key, key)
        };

        let unshared_key_len = key.len() - shared_prefix_len;

        self.buffer
            .write_u16::<BigEndian>(shared_prefix_len as u16)
            .unwrap();
        self.buffer
            .write_u16::<BigEndian>(unshared_key_len as u16)
            .unwrap();
        self.buffer
            .write_u32::<BigEndian>(value.len() as u32)
            .unwrap();
        self.buffer.extend_from_slice(&key[shared_prefix_len..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        for pos in &self.restart_positions {
            self.buffer.write_u32::<BigEndian>(*pos).unwrap();
        }
        self.buffer
            .write_u32::<BigEndian>(self.restart_positions.len() as u32)
            .unwrap();
        self.buffer
    }

    /// Current encoded size, used to decide when to cut a data block.
    pub fn size_estimate(&self) -> usize {
        self.buffer.len() + self.restart_positions.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(a, b)| a == b).count()
}

/// A decoded, immutable block.
#[derive(Clone)]
pub struct Block {
    data: Vec<u8>,
    restart_positions: Vec<u32>,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        use std::io::Cursor;

        let data_len = data.len();
        if data_len < 4 {
            return Err(Error::Corruption("block too short".to_string()));
        }

        let num_restarts_offset = data_len - 4;
        let mut cursor = Cursor::new(&data[num_restarts_offset..]);
        let num_restarts = cursor.read_u32::<BigEndian>()? as usize;

        let restart_array_size = num_restarts * 4;
        if num_restarts_offset < restart_array_size {
            return Err(Error::Corruption(
                "block too short for restart positions".to_string(),
            ));
        }

        let restart_array_offset = num_restarts_offset - restart_array_size;
        let mut cursor = Cursor::new(&data[restart_array_offset..num_restarts_offset]);
        let mut restart_positions = Vec::with_capacity(num_restarts);
        for _ in 0..num_restarts {
            let position = cursor.read_u32::<BigEndian>()?;
            if position as usize >= restart_array_offset.max(1) {
                return Err(Error::Corruption(
                    "restart position beyond entry data".to_string(),
                ));
            }
            restart_positions.push(position);
        }

        Ok(Self {
            data: data[..restart_array_offset].to_vec(),
            restart_positions,
        })
    }

    pub fn iter(self: &Arc<Self>) -> BlockIterator {
        BlockIterator::new(Arc::clone(self))
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Collects every entry in order. Used for the short meta blocks
    /// (metaindex, interval) where the whole block is walked anyway.
    pub fn entries(self: &Arc<Self>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.iter().collect()
    }
}

pub struct BlockIterator {
    block: Arc<Block>,
    current_offset: usize,
    last_key: Vec<u8>,
}

impl BlockIterator {
    pub fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            current_offset: 0,
            last_key: Vec::new(),
        }
    }

    /// Reads the key stored at a restart point without touching iterator
    /// state. Restart-point keys carry no shared prefix.
    fn read_restart_key(&self, offset: usize) -> Result<Vec<u8>> {
        let data = &self.block.data;
        let mut cursor = io::Cursor::new(&data[offset..]);

        let shared_len = cursor.read_u16::<BigEndian>()? as usize;
        let unshared_len = cursor.read_u16::<BigEndian>()? as usize;
        let _value_len = cursor.read_u32::<BigEndian>()?;

        if shared_len != 0 {
            return Err(Error::Corruption(
                "restart point key has a shared prefix".to_string(),
            ));
        }
        let key_start = offset + 8;
        if key_start + unshared_len > data.len() {
            return Err(Error::Corruption("restart key out of bounds".to_string()));
        }
        Ok(data[key_start..key_start + unshared_len].to_vec())
    }

    /// Positions the iterator so the next entry returned is the first one
    /// whose key is >= `target` under `cmp`.
    pub fn seek<F>(&mut self, target: &[u8], cmp: F) -> Result<()>
    where
        F: Fn(&[u8], &[u8]) -> Ordering,
    {
        // Binary search restart points for the last one with key < target.
        let mut left = 0;
        let mut right = self.block.restart_positions.len();
        while left < right {
            let mid = left + (right - left) / 2;
            let key = self.read_restart_key(self.block.restart_positions[mid] as usize)?;
            match cmp(&key, target) {
                Ordering::Less => left = mid + 1,
                _ => right = mid,
            }
        }
        let restart_index = left.saturating_sub(1);

        self.current_offset = self
            .block
            .restart_positions
            .get(restart_index)
            .map_or(0, |&p| p as usize);
        self.last_key.clear();

        // Scan forward until the next entry is >= target, remembering the
        // position to rewind to.
        loop {
            let saved_offset = self.current_offset;
            let saved_key = self.last_key.clone();
            match self.next() {
                Some(Ok((key, _))) => {
                    if cmp(&key, target) != Ordering::Less {
                        self.current_offset = saved_offset;
                        self.last_key = saved_key;
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }
}

impl Iterator for BlockIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_offset >= self.block.data.len() {
            return None;
        }

        let mut pos = self.current_offset;
        let data = &self.block.data;

        macro_rules! try_read {
            ($expr:expr, $field:expr) => {
                match $expr {
                    Ok(val) => val,
                    Err(_) => {
                        return Some(Err(Error::Corruption(format!(
                            "truncated {} in block entry",
                            $field
                        ))))
                    }
                }
            };
        }

        let shared_len = try_read!((&data[pos..]).read_u16::<BigEndian>(), "shared length") as usize;
        pos += 2;
        let unshared_len =
            try_read!((&data[pos..]).read_u16::<BigEndian>(), "unshared length") as usize;
        pos += 2;
        let value_len = try_read!((&data[pos..]).read_u32::<BigEndian>(), "value length") as usize;
        pos += 4;

        if shared_len > self.last_key.len() || pos + unshared_len + value_len > data.len() {
            return Some(Err(Error::Corruption(
                "block entry out of bounds".to_string(),
            )));
        }

        let mut key = Vec::with_capacity(shared_len + unshared_len);
        key.extend_from_slice(&self.last_key[..shared_len]);
        key.extend_from_slice(&data[pos..pos + unshared_len]);
        pos += unshared_len;

        let value = data[pos..pos + value_len].to_vec();
        pos += value_len;

        self.current_offset = pos;
        self.last_key = key.clone();

        Some(Ok((key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            (b"apple".to_vec(), b"fruit".to_vec()),
            (b"application".to_vec(), b"software".to_vec()),
            (b"banana".to_vec(), b"fruit".to_vec()),
            (b"band".to_vec(), b"music".to_vec()),
            (b"bandana".to_vec(), b"clothing".to_vec()),
        ]
    }

    fn build_block(entries: &[(Vec<u8>, Vec<u8>)], restart_interval: usize) -> Arc<Block> {
        let mut builder = Builder::new(restart_interval);
        for (key, value) in entries {
            builder.add_entry(key, value);
        }
        Arc::new(Block::new(builder.finish()).unwrap())
    }

    #[test]
    fn test_build_and_iterate() {
        let entries = sample_entries();
        for interval in [1, 2, 16] {
            let block = build_block(&entries, interval);
            let decoded: Vec<_> = block.iter().collect::<Result<_>>().unwrap();
            assert_eq!(decoded, entries);
        }
    }

    #[test]
    fn test_seek() {
        let entries = sample_entries();
        let block = build_block(&entries, 2);
        let cmp = |a: &[u8], b: &[u8]| a.cmp(b);

        let mut iter = block.iter();
        iter.seek(b"band", cmp).unwrap();
        let (key, _) = iter.next().unwrap().unwrap();
        assert_eq!(key, b"band");

        // Seek to an absent key lands on the next larger one.
        iter.seek(b"bana", cmp).unwrap();
        let (key, _) = iter.next().unwrap().unwrap();
        assert_eq!(key, b"banana");

        // Seek before the first entry.
        iter.seek(b"a", cmp).unwrap();
        let (key, _) = iter.next().unwrap().unwrap();
        assert_eq!(key, b"apple");

        // Seek past the last entry exhausts the iterator.
        iter.seek(b"zebra", cmp).unwrap();
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_restart_interval_one_shares_nothing() {
        let entries = sample_entries();
        let mut builder = Builder::new(1);
        for (key, value) in &entries {
            builder.add_entry(key, value);
        }
        assert_eq!(builder.entry_count(), entries.len());
        let estimate = builder.size_estimate();

        let data = builder.finish();
        assert_eq!(data.len(), estimate);

        // Every entry is a restart point, so each one is seekable directly.
        let block = Block::new(data).unwrap();
        assert_eq!(block.restart_positions.len(), entries.len());
        assert!(block.size() < estimate);
    }

    #[test]
    fn test_corrupt_block_rejected() {
        assert!(Block::new(vec![0, 1]).is_err());
        // Restart count claims more restarts than the block can hold.
        assert!(Block::new(vec![0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
