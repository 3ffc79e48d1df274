//! Internal key encoding.
//!
//! Every record version is keyed by its user key plus an 8-byte tag packing
//! the sequence number and the record type: `tag = (sequence << 8) | type`.
//! Internal keys order by user key ascending, then tag *descending*, so the
//! newest visible version of a key is the first one a seek lands on.

use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::errcorrupt;
use crate::error::Result;

/// Length of the tag suffix on every internal key.
pub const TAG_LEN: usize = 8;

/// Record type, packed into the low byte of the tag. Deletion sorts after
/// Value at the same sequence so a snapshot seek prefers the Value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Deletion = 0,
    Value = 1,
}

impl ValueType {
    pub fn from_tag(tag: u64) -> Result<ValueType> {
        match tag & 0xff {
            0 => Ok(ValueType::Deletion),
            1 => Ok(ValueType::Value),
            t => errcorrupt!("unknown value type {t} in tag"),
        }
    }
}

/// Packs a sequence number and type into a tag.
pub fn pack_tag(seq: u64, vtype: ValueType) -> u64 {
    (seq << 8) | vtype as u64
}

/// Sequence number half of a tag.
pub fn tag_sequence(tag: u64) -> u64 {
    tag >> 8
}

/// Encodes `user_key || tag` as an internal key.
pub fn encode_internal(user_key: &[u8], seq: u64, vtype: ValueType) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_key.len() + TAG_LEN);
    key.extend_from_slice(user_key);
    let mut tag = [0u8; TAG_LEN];
    BigEndian::write_u64(&mut tag, pack_tag(seq, vtype));
    key.extend_from_slice(&tag);
    key
}

/// Splits an internal key into its user key and tag.
pub fn split_internal(ikey: &[u8]) -> Result<(&[u8], u64)> {
    if ikey.len() < TAG_LEN {
        return errcorrupt!("internal key shorter than its tag ({} bytes)", ikey.len());
    }
    let (user_key, tag_bytes) = ikey.split_at(ikey.len() - TAG_LEN);
    Ok((user_key, BigEndian::read_u64(tag_bytes)))
}

/// User key portion of an internal key, without decoding the tag.
pub fn user_key(ikey: &[u8]) -> &[u8] {
    &ikey[..ikey.len().saturating_sub(TAG_LEN)]
}

/// Internal key ordering: user key ascending, then tag descending.
pub fn icmp(a: &[u8], b: &[u8]) -> Ordering {
    let (ua, ta) = (user_key(a), tag_of(a));
    let (ub, tb) = (user_key(b), tag_of(b));
    ua.cmp(ub).then(tb.cmp(&ta))
}

fn tag_of(ikey: &[u8]) -> u64 {
    if ikey.len() < TAG_LEN {
        return 0;
    }
    BigEndian::read_u64(&ikey[ikey.len() - TAG_LEN..])
}

/// The internal key a snapshot read seeks with: the largest tag visible at
/// `snapshot` for the given user key.
pub fn seek_key(user_key: &[u8], snapshot: u64) -> Vec<u8> {
    encode_internal(user_key, snapshot, ValueType::Value)
}

/// Composite key fed to the secondary filter: `secondary_value || tag`,
/// with the tag little-endian. Unlike internal keys, composite keys are
/// only ever hashed, never ordered, and their byte layout is fixed.
pub fn composite_key(secondary_value: &str, tag: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(secondary_value.len() + TAG_LEN);
    key.extend_from_slice(secondary_value.as_bytes());
    let mut buf = [0u8; TAG_LEN];
    LittleEndian::write_u64(&mut buf, tag);
    key.extend_from_slice(&buf);
    key
}

/// Memtable key wrapper ordering raw internal keys with `icmp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemKey(pub Vec<u8>);

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        icmp(&self.0, &other.0)
    }
}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        let tag = pack_tag(42, ValueType::Value);
        assert_eq!(tag_sequence(tag), 42);
        assert_eq!(ValueType::from_tag(tag).unwrap(), ValueType::Value);

        let tag = pack_tag(7, ValueType::Deletion);
        assert_eq!(tag_sequence(tag), 7);
        assert_eq!(ValueType::from_tag(tag).unwrap(), ValueType::Deletion);
    }

    #[test]
    fn test_composite_key_layout() {
        let tag = pack_tag(3, ValueType::Value);
        let key = composite_key("blue", tag);
        assert_eq!(key.len(), 4 + TAG_LEN);
        assert_eq!(&key[..4], b"blue");
        // The composite tag is little-endian, unlike internal-key tags.
        assert_eq!(u64::from_le_bytes(key[4..].try_into().unwrap()), tag);
    }

    #[test]
    fn test_split_internal() {
        let ikey = encode_internal(b"user7", 9, ValueType::Value);
        let (ukey, tag) = split_internal(&ikey).unwrap();
        assert_eq!(ukey, b"user7");
        assert_eq!(tag, pack_tag(9, ValueType::Value));

        assert!(split_internal(b"short").is_err());
    }

    #[test]
    fn test_ordering_newest_first() {
        let old = encode_internal(b"k", 5, ValueType::Value);
        let new = encode_internal(b"k", 9, ValueType::Value);
        let other = encode_internal(b"l", 1, ValueType::Value);

        // Same user key: higher sequence sorts first.
        assert_eq!(icmp(&new, &old), Ordering::Less);
        // Different user keys order bytewise regardless of sequence.
        assert_eq!(icmp(&old, &other), Ordering::Less);
    }

    #[test]
    fn test_seek_key_lands_on_newest_visible() {
        let v8 = encode_internal(b"k", 8, ValueType::Value);
        let v12 = encode_internal(b"k", 12, ValueType::Value);
        let seek = seek_key(b"k", 10);

        // Seeking at snapshot 10 must skip sequence 12 and land before
        // sequence 8 in the descending-tag order.
        assert_eq!(icmp(&v12, &seek), Ordering::Less);
        assert_eq!(icmp(&seek, &v8), Ordering::Less);
    }

    #[test]
    fn test_deletion_sorts_after_value_at_same_sequence() {
        let value = encode_internal(b"k", 4, ValueType::Value);
        let deletion = encode_internal(b"k", 4, ValueType::Deletion);
        assert_eq!(icmp(&value, &deletion), Ordering::Less);
    }
}
