//! Write buffers.
//!
//! The primary side is a concurrent skip list keyed by internal key, so a
//! buffer holds every version of a user key and snapshot reads land on the
//! newest visible one. Alongside it lives the secondary memtable (SMT): an
//! inverted list from secondary value to the primary keys recently written
//! with that value, in insertion order.
//!
//! The SMT is deliberately allowed to go stale: overwrites leave old
//! primary keys behind in their old buckets. Lookups compensate by
//! re-reading each candidate's current payload at the query snapshot and
//! re-extracting its secondary value; only candidates whose fresh value
//! still matches are admitted. That re-extraction is a correctness
//! requirement, not an optimization.
//!
//! A buffer freezes when the store rotates it into the immutable queue; the
//! buffer and its SMT are dropped together once flushed into an SSTable.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crossbeam_skiplist::SkipMap;

use crate::error::Result;
use crate::extract::extract_attr;
use crate::ikey::{encode_internal, seek_key, split_internal, MemKey, ValueType};
use crate::query::TopKCollector;
use crate::Error;

/// Re-read hook the SMT lookups verify candidates through: primary key ->
/// newest visible `(tag, payload)` at the query snapshot.
pub type ReadFn<'a> = dyn Fn(&[u8]) -> Result<Option<(u64, Vec<u8>)>> + 'a;

pub struct WriteBuffer {
    /// Internal key -> payload. Deletions store an empty payload.
    data: SkipMap<MemKey, Vec<u8>>,
    /// Secondary value -> primary keys, insertion order, duplicates allowed.
    secondary: Mutex<BTreeMap<String, Vec<Vec<u8>>>>,
    secondary_attr: String,
    size: AtomicUsize,
    max_seq: AtomicU64,
    frozen: AtomicBool,
}

impl WriteBuffer {
    pub fn new(secondary_attr: String) -> Self {
        Self {
            data: SkipMap::new(),
            secondary: Mutex::new(BTreeMap::new()),
            secondary_attr,
            size: AtomicUsize::new(0),
            max_seq: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    /// Inserts one record version. The caller serializes writers, so the
    /// skip-list insert and the SMT append are atomic to readers.
    pub fn add(&self, seq: u64, vtype: ValueType, user_key: &[u8], payload: &[u8]) -> Result<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }

        let ikey = encode_internal(user_key, seq, vtype);
        self.size
            .fetch_add(ikey.len() + payload.len(), Ordering::SeqCst);
        self.max_seq.fetch_max(seq, Ordering::SeqCst);
        self.data.insert(MemKey(ikey), payload.to_vec());

        // Deletions never enter the SMT; neither do records the secondary
        // value cannot be extracted from.
        if vtype == ValueType::Deletion || self.secondary_attr.is_empty() {
            return Ok(());
        }
        let Ok(secondary_value) = extract_attr(payload, &self.secondary_attr) else {
            return Ok(());
        };

        let mut secondary = self.secondary.lock()?;
        secondary
            .entry(secondary_value)
            .or_default()
            .push(user_key.to_vec());
        Ok(())
    }

    /// Newest version of `key` visible at `snapshot`, as `(tag, payload)`.
    pub fn get(&self, key: &[u8], snapshot: u64) -> Result<Option<(u64, Vec<u8>)>> {
        let seek = MemKey(seek_key(key, snapshot));
        if let Some(entry) = self
            .data
            .range((Bound::Included(seek), Bound::Unbounded))
            .next()
        {
            let (found_key, tag) = split_internal(&entry.key().0)?;
            if found_key == key {
                return Ok(Some((tag, entry.value().clone())));
            }
        }
        Ok(None)
    }

    /// Point lookup through the SMT: walk the bucket newest-first, verify
    /// each candidate through `read`, and admit matches.
    pub fn point_lookup(
        &self,
        skey: &str,
        collector: &mut TopKCollector,
        read: &ReadFn,
    ) -> Result<()> {
        let candidates = {
            let secondary = self.secondary.lock()?;
            match secondary.get(skey) {
                Some(bucket) => bucket.iter().rev().cloned().collect::<Vec<_>>(),
                None => return Ok(()),
            }
        };
        self.verify_and_admit(&candidates, skey, skey, collector, read)
    }

    /// Range lookup: every bucket with key in `[low, high]`, in bucket
    /// order, newest-first within each bucket.
    pub fn range_lookup(
        &self,
        low: &str,
        high: &str,
        collector: &mut TopKCollector,
        read: &ReadFn,
    ) -> Result<()> {
        let candidates = {
            let secondary = self.secondary.lock()?;
            secondary
                .range(low.to_string()..=high.to_string())
                .flat_map(|(_, bucket)| bucket.iter().rev().cloned())
                .collect::<Vec<_>>()
        };
        self.verify_and_admit(&candidates, low, high, collector, read)
    }

    fn verify_and_admit(
        &self,
        candidates: &[Vec<u8>],
        low: &str,
        high: &str,
        collector: &mut TopKCollector,
        read: &ReadFn,
    ) -> Result<()> {
        for primary_key in candidates {
            if collector.is_seen(primary_key) {
                continue;
            }
            let Some((tag, payload)) = read(primary_key)? else {
                continue;
            };
            if ValueType::from_tag(tag)? == ValueType::Deletion {
                // The record is dead at this snapshot; its tombstone also
                // hides any older copies in colder sources.
                collector.mark_seen(primary_key);
                continue;
            }
            // Stale bucket entries are filtered here: only a fresh payload
            // whose re-extracted value still satisfies the query counts.
            let Ok(fresh_value) = extract_attr(&payload, &self.secondary_attr) else {
                continue;
            };
            if fresh_value.as_str() >= low && fresh_value.as_str() <= high {
                collector.offer(primary_key, payload, tag);
            }
        }
        Ok(())
    }

    /// Ordered iteration over every `(internal key, payload)` entry, for
    /// flushing into an SSTable.
    pub fn iter(&self) -> impl Iterator<Item = (Vec<u8>, Vec<u8>)> + '_ {
        self.data
            .iter()
            .map(|entry| (entry.key().0.clone(), entry.value().clone()))
    }

    pub fn freeze(&self) -> Result<()> {
        if self.frozen.swap(true, Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn max_seq(&self) -> u64 {
        self.max_seq.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}
