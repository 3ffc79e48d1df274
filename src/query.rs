//! Top-K assembly for secondary queries.
//!
//! The collector is shared by every source the evaluator visits: a min-heap
//! of at most K hits keyed by tag (sequence number in the high bits), plus
//! the `seen` set of primary keys already spoken for. A candidate is
//! admitted iff its primary key is unseen AND the heap has room or the
//! candidate outranks the heap minimum; evicting a hit releases its primary
//! key again. Deletions claim their primary key in `seen` without entering
//! the heap, which is how a tombstone hides older copies in colder sources.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::ikey::tag_sequence;

/// One secondary query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryHit {
    /// Primary key of the matching record.
    pub primary_key: Vec<u8>,
    /// The record's payload at the query snapshot.
    pub payload: Vec<u8>,
    /// `(sequence << 8) | type` of the admitted version.
    pub tag: u64,
}

impl SecondaryHit {
    pub fn sequence(&self) -> u64 {
        tag_sequence(self.tag)
    }
}

/// Per-query options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Sequence number bounding visibility; defaults to the store's current
    /// last sequence.
    pub snapshot: Option<u64>,
    /// Cooperative cancellation flag, checked at every source boundary and
    /// iterator step.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl QueryOptions {
    pub(crate) fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// Heap entry ordered by tag, ties broken by primary key.
#[derive(Debug)]
struct Hit {
    tag: u64,
    primary_key: Vec<u8>,
    payload: Vec<u8>,
}

impl PartialEq for Hit {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag && self.primary_key == other.primary_key
    }
}

impl Eq for Hit {}

impl Ord for Hit {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.tag
            .cmp(&other.tag)
            .then_with(|| self.primary_key.cmp(&other.primary_key))
    }
}

impl PartialOrd for Hit {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct TopKCollector {
    cap: usize,
    heap: BinaryHeap<Reverse<Hit>>,
    seen: HashSet<Vec<u8>>,
}

impl TopKCollector {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            heap: BinaryHeap::with_capacity(cap.min(1024) + 1),
            seen: HashSet::new(),
        }
    }

    /// True if the primary key is already claimed, by an admitted hit or a
    /// tombstone.
    pub fn is_seen(&self, primary_key: &[u8]) -> bool {
        self.seen.contains(primary_key)
    }

    /// Claims a primary key without admitting anything.
    pub fn mark_seen(&mut self, primary_key: &[u8]) {
        self.seen.insert(primary_key.to_vec());
    }

    /// Applies the admission rule. Returns true if the candidate entered
    /// the heap.
    pub fn offer(&mut self, primary_key: &[u8], payload: Vec<u8>, tag: u64) -> bool {
        if self.cap == 0 || self.seen.contains(primary_key) {
            return false;
        }
        if self.heap.len() < self.cap {
            self.seen.insert(primary_key.to_vec());
            self.heap.push(Reverse(Hit {
                tag,
                primary_key: primary_key.to_vec(),
                payload,
            }));
            return true;
        }
        if tag > self.heap.peek().map_or(0, |Reverse(min)| min.tag) {
            if let Some(Reverse(evicted)) = self.heap.pop() {
                self.seen.remove(&evicted.primary_key);
            }
            self.seen.insert(primary_key.to_vec());
            self.heap.push(Reverse(Hit {
                tag,
                primary_key: primary_key.to_vec(),
                payload,
            }));
            return true;
        }
        false
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.cap
    }

    /// Sequence number of the weakest admitted hit, or 0 when empty.
    pub fn min_sequence(&self) -> u64 {
        self.heap
            .peek()
            .map_or(0, |Reverse(min)| tag_sequence(min.tag))
    }

    /// Drains the heap into hits sorted by tag descending.
    pub fn into_hits(self) -> Vec<SecondaryHit> {
        let mut hits: Vec<Hit> = self.heap.into_iter().map(|Reverse(hit)| hit).collect();
        hits.sort_by(|a, b| b.cmp(a));
        hits.into_iter()
            .map(|hit| SecondaryHit {
                primary_key: hit.primary_key,
                payload: hit.payload,
                tag: hit.tag,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikey::{pack_tag, ValueType};

    fn tag(seq: u64) -> u64 {
        pack_tag(seq, ValueType::Value)
    }

    #[test]
    fn test_admission_and_eviction() {
        let mut collector = TopKCollector::new(2);
        assert!(collector.offer(b"a", b"pa".to_vec(), tag(1)));
        assert!(collector.offer(b"b", b"pb".to_vec(), tag(5)));
        assert!(collector.is_full());

        // Too old to displace anything.
        assert!(!collector.offer(b"c", b"pc".to_vec(), tag(1)));
        // Newer: evicts the minimum and releases its key.
        assert!(collector.offer(b"d", b"pd".to_vec(), tag(9)));
        assert!(!collector.is_seen(b"a"));

        let hits = collector.into_hits();
        let keys: Vec<_> = hits.iter().map(|h| h.primary_key.clone()).collect();
        assert_eq!(keys, vec![b"d".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_duplicate_primary_key_rejected() {
        let mut collector = TopKCollector::new(10);
        assert!(collector.offer(b"a", b"new".to_vec(), tag(9)));
        assert!(!collector.offer(b"a", b"old".to_vec(), tag(3)));
        assert_eq!(collector.into_hits().len(), 1);
    }

    #[test]
    fn test_tombstone_blocks_older_copy() {
        let mut collector = TopKCollector::new(10);
        collector.mark_seen(b"a");
        assert!(!collector.offer(b"a", b"stale".to_vec(), tag(3)));
        assert!(collector.into_hits().is_empty());
    }

    #[test]
    fn test_results_sequence_descending() {
        let mut collector = TopKCollector::new(5);
        for (key, seq) in [(b"a", 4u64), (b"b", 9), (b"c", 1), (b"d", 7)] {
            collector.offer(key, Vec::new(), tag(seq));
        }
        let sequences: Vec<u64> = collector.into_hits().iter().map(|h| h.sequence()).collect();
        assert_eq!(sequences, vec![9, 7, 4, 1]);
    }

    #[test]
    fn test_zero_capacity() {
        let mut collector = TopKCollector::new(0);
        assert!(!collector.offer(b"a", Vec::new(), tag(1)));
        assert!(collector.into_hits().is_empty());
    }

    #[test]
    fn test_min_sequence_tracks_heap_floor() {
        let mut collector = TopKCollector::new(2);
        assert_eq!(collector.min_sequence(), 0);
        collector.offer(b"a", Vec::new(), tag(4));
        collector.offer(b"b", Vec::new(), tag(9));
        assert_eq!(collector.min_sequence(), 4);
    }
}
