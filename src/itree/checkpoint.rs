//! Interval tree checkpoint file.
//!
//! A flat sequence of interval records, rewritten in full on every
//! checkpoint:
//!
//! ```text
//! +-----------+-----------+
//! | magic:u32 | count:u32 |
//! +-----------+-----------+
//! | id_len:u32  | id bytes  |
//! | low_len:u32 | low bytes |
//! | high_len:u32| high bytes|
//! | timestamp:u64           |   (per record)
//! +-------------------------+
//! ```
//!
//! The write is not crash-atomic. A missing or unreadable file forces a
//! rebuild from SSTable scans, never a wrong answer.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::errcorrupt;
use crate::error::Result;

use super::tree::Interval;

const CHECKPOINT_MAGIC: u32 = 0x6a69_7431; // "jit1"

/// Maximum accepted length for any single checkpoint field.
const MAX_FIELD_LEN: usize = 1 << 20;

pub fn write(path: &Path, intervals: &[Interval]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);

    writer.write_u32::<BigEndian>(CHECKPOINT_MAGIC)?;
    writer.write_u32::<BigEndian>(intervals.len() as u32)?;
    for interval in intervals {
        for field in [&interval.id, &interval.low, &interval.high] {
            writer.write_u32::<BigEndian>(field.len() as u32)?;
            writer.write_all(field.as_bytes())?;
        }
        writer.write_u64::<BigEndian>(interval.timestamp)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read(path: &Path) -> Result<Vec<Interval>> {
    let mut reader = BufReader::new(File::open(path)?);

    let magic = reader.read_u32::<BigEndian>()?;
    if magic != CHECKPOINT_MAGIC {
        return errcorrupt!("bad checkpoint magic {magic:#010x}");
    }

    let count = reader.read_u32::<BigEndian>()?;
    let mut intervals = Vec::with_capacity(count.min(1 << 20) as usize);
    for _ in 0..count {
        let id = read_field(&mut reader)?;
        let low = read_field(&mut reader)?;
        let high = read_field(&mut reader)?;
        let timestamp = reader.read_u64::<BigEndian>()?;
        intervals.push(Interval::new(id, low, high, timestamp));
    }
    Ok(intervals)
}

fn read_field(reader: &mut impl Read) -> Result<String> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    if len > MAX_FIELD_LEN {
        return errcorrupt!("checkpoint field length {len} exceeds limit");
    }
    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer)?;
    String::from_utf8(buffer).map_err(|e| crate::Error::Corruption(e.to_string()))
}
