//! SSTable file layout primitives: block handles, the footer, and the
//! CRC-protected raw block read/write path.
//!
//! ```text
//! +--------------------+
//! | Data Block 1..N    |
//! +--------------------+
//! | Filter Block       |
//! +--------------------+
//! | Sec. Filter Block  |
//! +--------------------+
//! | Metaindex Block    |
//! +--------------------+
//! | Interval Block     |  (interval-block mode only)
//! +--------------------+
//! | Index Block        |
//! +--------------------+
//! | Footer             |
//! +--------------------+
//! ```
//!
//! The footer is `[interval_handle] || metaindex_handle || index_handle ||
//! magic:u32`, where the interval handle is present exactly in
//! interval-block mode. The two footer lengths (52 vs 36 bytes) encode the
//! mode; which one to read is established at open from the store
//! configuration.
//!
//! Every block is followed by a `u32` CRC over its contents.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::errcorrupt;
use crate::error::Result;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const TABLE_MAGIC: u32 = 0x6a74_6231; // "jtb1"
pub const BLOCK_TRAILER_LEN: u64 = 4;
pub const HANDLE_ENCODED_LEN: usize = 16;
pub const FOOTER_LEN: u64 = 2 * HANDLE_ENCODED_LEN as u64 + 4;
pub const FOOTER_EXTENDED_LEN: u64 = 3 * HANDLE_ENCODED_LEN as u64 + 4;

/// Location of a block inside the table file. `size` excludes the CRC
/// trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn encode_to(&self, buffer: &mut Vec<u8>) {
        buffer.write_u64::<BigEndian>(self.offset).unwrap();
        buffer.write_u64::<BigEndian>(self.size).unwrap();
    }

    pub fn encoded(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(HANDLE_ENCODED_LEN);
        self.encode_to(&mut buffer);
        buffer
    }

    pub fn decode_from(mut input: &[u8]) -> Result<Self> {
        let offset = input.read_u64::<BigEndian>()?;
        let size = input.read_u64::<BigEndian>()?;
        Ok(Self { offset, size })
    }
}

/// Table footer. `interval` is present exactly in interval-block mode.
#[derive(Debug, Clone, Default)]
pub struct Footer {
    pub metaindex: BlockHandle,
    pub index: BlockHandle,
    pub interval: Option<BlockHandle>,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        if let Some(interval) = &self.interval {
            interval.encode_to(&mut buffer);
        }
        self.metaindex.encode_to(&mut buffer);
        self.index.encode_to(&mut buffer);
        buffer.write_u32::<BigEndian>(TABLE_MAGIC).unwrap();
        buffer
    }

    pub fn decode(data: &[u8], interval_mode: bool) -> Result<Self> {
        let expected = if interval_mode {
            FOOTER_EXTENDED_LEN
        } else {
            FOOTER_LEN
        } as usize;
        if data.len() != expected {
            return errcorrupt!("footer is {} bytes, expected {expected}", data.len());
        }

        let mut pos = 0;
        let interval = if interval_mode {
            let handle = BlockHandle::decode_from(&data[pos..])?;
            pos += HANDLE_ENCODED_LEN;
            Some(handle)
        } else {
            None
        };
        let metaindex = BlockHandle::decode_from(&data[pos..])?;
        pos += HANDLE_ENCODED_LEN;
        let index = BlockHandle::decode_from(&data[pos..])?;
        pos += HANDLE_ENCODED_LEN;

        let magic = (&data[pos..]).read_u32::<BigEndian>()?;
        if magic != TABLE_MAGIC {
            return errcorrupt!("bad table magic {magic:#010x}");
        }

        Ok(Self {
            metaindex,
            index,
            interval,
        })
    }

    /// Reads the footer from the end of an open table file.
    pub fn read_from(file: &File, file_size: u64, interval_mode: bool) -> Result<Self> {
        let len = if interval_mode {
            FOOTER_EXTENDED_LEN
        } else {
            FOOTER_LEN
        };
        if file_size < len {
            return errcorrupt!("file too short ({file_size} bytes) to be an sstable");
        }

        let mut reader = file.try_clone()?;
        reader.seek(SeekFrom::Start(file_size - len))?;
        let mut buffer = vec![0u8; len as usize];
        reader.read_exact(&mut buffer)?;
        Footer::decode(&buffer, interval_mode)
    }
}

/// Appends a block and its CRC trailer at `*offset`, advancing the offset.
pub fn append_block(file: &mut File, offset: &mut u64, contents: &[u8]) -> Result<BlockHandle> {
    let handle = BlockHandle {
        offset: *offset,
        size: contents.len() as u64,
    };
    file.write_all(contents)?;
    file.write_u32::<BigEndian>(CRC32.checksum(contents))?;
    *offset += contents.len() as u64 + BLOCK_TRAILER_LEN;
    Ok(handle)
}

/// Reads the block at `handle`, optionally verifying the CRC trailer.
pub fn read_block(file: &File, handle: BlockHandle, verify_checksum: bool) -> Result<Vec<u8>> {
    let mut reader = file.try_clone()?;
    reader.seek(SeekFrom::Start(handle.offset))?;

    let mut contents = vec![0u8; handle.size as usize];
    reader.read_exact(&mut contents)?;

    if verify_checksum {
        let stored = reader.read_u32::<BigEndian>()?;
        let computed = CRC32.checksum(&contents);
        if stored != computed {
            return errcorrupt!(
                "block checksum mismatch at offset {}: stored {stored:#010x}, computed {computed:#010x}",
                handle.offset
            );
        }
    }
    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_roundtrip() {
        let handle = BlockHandle {
            offset: 1234,
            size: 567,
        };
        assert_eq!(BlockHandle::decode_from(&handle.encoded()).unwrap(), handle);
    }

    #[test]
    fn test_footer_roundtrip_both_variants() {
        let footer = Footer {
            metaindex: BlockHandle {
                offset: 10,
                size: 20,
            },
            index: BlockHandle {
                offset: 30,
                size: 40,
            },
            interval: None,
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len() as u64, FOOTER_LEN);
        let decoded = Footer::decode(&encoded, false).unwrap();
        assert_eq!(decoded.metaindex, footer.metaindex);
        assert_eq!(decoded.index, footer.index);
        assert!(decoded.interval.is_none());

        let footer = Footer {
            interval: Some(BlockHandle { offset: 5, size: 6 }),
            ..footer
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len() as u64, FOOTER_EXTENDED_LEN);
        let decoded = Footer::decode(&encoded, true).unwrap();
        assert_eq!(decoded.interval, footer.interval);
    }

    #[test]
    fn test_footer_length_mismatch_rejected() {
        let footer = Footer::default();
        let encoded = footer.encode();
        assert!(Footer::decode(&encoded, true).is_err());
    }

    #[test]
    fn test_block_write_read_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        let mut file = File::create(&path).unwrap();
        let mut offset = 0;

        let first = append_block(&mut file, &mut offset, b"hello blocks").unwrap();
        let second = append_block(&mut file, &mut offset, b"more data").unwrap();
        file.sync_all().unwrap();

        let file = File::open(&path).unwrap();
        assert_eq!(read_block(&file, first, true).unwrap(), b"hello blocks");
        assert_eq!(read_block(&file, second, true).unwrap(), b"more data");

        // A handle pointing into the middle of a block fails verification.
        let bogus = BlockHandle {
            offset: first.offset + 1,
            size: first.size,
        };
        assert!(read_block(&file, bogus, true).is_err());
    }
}
