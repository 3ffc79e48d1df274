//! Secondary query evaluation.
//!
//! `sget` and `srange` assemble a top-K result across every source, newest
//! first: the active buffer's SMT, the frozen buffers' SMTs, then the
//! tables. In interval tree mode the table stage is a single global walk of
//! candidate blocks in descending max-sequence order, short-circuited as
//! soon as the heap is full and the next block cannot improve it. In
//! interval-block mode tables are visited newest first with range pruning
//! at the table and block level.
//!
//! Every candidate a scan surfaces is verified by re-reading its primary
//! key through the whole store at the query snapshot and re-extracting the
//! secondary value from the fresh payload. Only a live, matching fresh
//! version is admitted, carrying the fresh tag; a fresh tombstone claims
//! the key so older copies in colder sources stay hidden. This is what
//! keeps results consistent when the newest version of a key lives in a
//! block the interval pruning never visits.

use std::sync::Arc;

use crate::errinput;
use crate::error::Result;
use crate::extract::extract_attr;
use crate::ikey::{split_internal, tag_sequence, ValueType};
use crate::itree::IntervalTree;
use crate::memtable::WriteBuffer;
use crate::query::{QueryOptions, SecondaryHit, TopKCollector};
use crate::sstable::Table;
use crate::Error;

use super::Store;

impl Store {
    /// Point secondary lookup: up to `top_k` records whose secondary value
    /// equals `skey`, in descending sequence order.
    pub fn sget(&self, skey: &str, top_k: usize) -> Result<Vec<SecondaryHit>> {
        self.sget_opt(skey, top_k, &QueryOptions::default())
    }

    pub fn sget_opt(
        &self,
        skey: &str,
        top_k: usize,
        opts: &QueryOptions,
    ) -> Result<Vec<SecondaryHit>> {
        if !self.config().secondary_enabled() {
            return errinput!("secondary key attribute not configured");
        }
        self.secondary_query(skey, skey, true, top_k, opts)
    }

    /// Range secondary lookup over the closed interval `[low, high]`,
    /// lexicographic bounds.
    pub fn srange(&self, low: &str, high: &str, top_k: usize) -> Result<Vec<SecondaryHit>> {
        self.srange_opt(low, high, top_k, &QueryOptions::default())
    }

    pub fn srange_opt(
        &self,
        low: &str,
        high: &str,
        top_k: usize,
        opts: &QueryOptions,
    ) -> Result<Vec<SecondaryHit>> {
        if !self.config().secondary_enabled() {
            return errinput!("secondary key attribute not configured");
        }
        if low > high {
            return errinput!("range low {low:?} exceeds high {high:?}");
        }
        self.secondary_query(low, high, false, top_k, opts)
    }

    fn secondary_query(
        &self,
        low: &str,
        high: &str,
        point: bool,
        top_k: usize,
        opts: &QueryOptions,
    ) -> Result<Vec<SecondaryHit>> {
        let snapshot = opts.snapshot.unwrap_or_else(|| self.last_sequence());
        let mut collector = TopKCollector::new(top_k);
        let read = |key: &[u8]| self.read_internal(key, snapshot);

        // 1. Active buffer's SMT.
        if opts.cancelled() {
            return Err(Error::Cancelled);
        }
        let active = self.active_buffer()?;
        if point {
            active.point_lookup(low, &mut collector, &read)?;
        } else {
            active.range_lookup(low, high, &mut collector, &read)?;
        }

        // 2. Frozen buffers, newest first. A buffer whose newest sequence
        // cannot beat the heap floor ends the stage; everything behind it
        // is older still.
        for buffer in self.immutable_buffers()? {
            if opts.cancelled() {
                return Err(Error::Cancelled);
            }
            if collector.is_full() && buffer.max_seq() <= collector.min_sequence() {
                break;
            }
            if point {
                buffer.point_lookup(low, &mut collector, &read)?;
            } else {
                buffer.range_lookup(low, high, &mut collector, &read)?;
            }
        }

        // 3. Tables.
        match self.interval_tree() {
            Some(itree) => {
                let itree = Arc::clone(itree);
                self.itree_stage(&itree, low, high, point, snapshot, &mut collector, opts)?
            }
            None => self.table_stage(low, high, point, snapshot, &mut collector, opts)?,
        }

        Ok(collector.into_hits())
    }

    /// Interval tree mode: one global descending-sequence walk over
    /// candidate blocks across all tables.
    #[allow(clippy::too_many_arguments)]
    fn itree_stage(
        &self,
        itree: &IntervalTree,
        low: &str,
        high: &str,
        point: bool,
        snapshot: u64,
        collector: &mut TopKCollector,
        opts: &QueryOptions,
    ) -> Result<()> {
        let delim = self.config().id_delim;
        let mut iter = itree.top_k_iter(low, high)?;

        loop {
            if opts.cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(interval) = iter.next()? else {
                break;
            };
            // Blocks arrive in descending max-sequence order; once the heap
            // is full nothing older can change the result.
            if collector.is_full() && interval.timestamp <= collector.min_sequence() {
                break;
            }

            let Some((prefix, suffix)) = interval.id.split_once(delim) else {
                continue;
            };
            let Ok(file_number) = prefix.parse::<u64>() else {
                continue;
            };
            // Intervals can outlive their table briefly; skip orphans.
            let Some(table) = self.table_by_number(file_number)? else {
                continue;
            };

            let mut saver = |ikey: &[u8], _payload: &[u8]| {
                self.admit_candidate(ikey, snapshot, low, high, collector)
            };
            table.evaluate_block(suffix, point.then_some(low), &mut saver)?;
        }
        Ok(())
    }

    /// Interval-block mode: tables newest first, pruned by table-level
    /// range, then per block inside `Table`.
    fn table_stage(
        &self,
        low: &str,
        high: &str,
        point: bool,
        snapshot: u64,
        collector: &mut TopKCollector,
        opts: &QueryOptions,
    ) -> Result<()> {
        for table in self.all_tables()? {
            if opts.cancelled() {
                return Err(Error::Cancelled);
            }
            // Tables are registered in flush order, so sequence ranges
            // decrease monotonically down the list.
            if collector.is_full() && table.max_seq() <= collector.min_sequence() {
                break;
            }
            let Some((smallest, largest)) = table.sec_range() else {
                continue;
            };
            if low > largest || high < smallest {
                continue;
            }

            let mut saver = |ikey: &[u8], _payload: &[u8]| {
                self.admit_candidate(ikey, snapshot, low, high, collector)
            };
            if point {
                table.evaluate_point(low, &mut saver)?;
            } else {
                table.evaluate_range(low, high, &mut saver)?;
            }
        }
        Ok(())
    }

    /// The saver: decides one scanned entry. The scanned payload is not
    /// trusted; the record's current version at the snapshot is.
    fn admit_candidate(
        &self,
        ikey: &[u8],
        snapshot: u64,
        low: &str,
        high: &str,
        collector: &mut TopKCollector,
    ) -> Result<()> {
        let (user_key, tag) = split_internal(ikey)?;
        if tag_sequence(tag) > snapshot {
            return Ok(());
        }
        if collector.is_seen(user_key) {
            return Ok(());
        }

        let Some((fresh_tag, fresh_payload)) = self.read_internal(user_key, snapshot)? else {
            return Ok(());
        };
        if ValueType::from_tag(fresh_tag)? == ValueType::Deletion {
            collector.mark_seen(user_key);
            return Ok(());
        }
        let Ok(fresh_value) = extract_attr(&fresh_payload, &self.config().secondary_key) else {
            return Ok(());
        };
        if fresh_value.as_str() >= low && fresh_value.as_str() <= high {
            collector.offer(user_key, fresh_payload, fresh_tag);
        }
        Ok(())
    }

    fn active_buffer(&self) -> Result<Arc<WriteBuffer>> {
        Ok(self.active.read()?.clone())
    }

    fn immutable_buffers(&self) -> Result<Vec<Arc<WriteBuffer>>> {
        Ok(self.immutables.read()?.iter().rev().cloned().collect())
    }

    fn all_tables(&self) -> Result<Vec<Arc<Table>>> {
        Ok(self.tables.read()?.iter().cloned().collect())
    }

    fn table_by_number(&self, file_number: u64) -> Result<Option<Arc<Table>>> {
        Ok(self
            .tables
            .read()?
            .iter()
            .find(|table| table.file_number() == file_number)
            .cloned())
    }
}
