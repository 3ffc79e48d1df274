//! The store: write buffers, SSTables, and the secondary index glued into
//! one surface.
//!
//! # Write path
//!
//! `put` derives the primary key from the payload's configured attribute,
//! assigns the next sequence number under the write mutex, and inserts into
//! the active buffer; the skip-list insert and the SMT append happen inside
//! that critical section so readers never observe one without the other.
//! A full buffer is frozen onto the immutable queue; `flush` builds an
//! SSTable from the oldest frozen buffer and registers it, newest first.
//!
//! # Read path
//!
//! Primary reads walk active buffer, frozen buffers (newest to oldest),
//! then tables in recency order, all bounded by a snapshot sequence.
//! Secondary reads live in the `secondary` module.
//!
//! # Interval tree lifecycle
//!
//! In interval tree mode the tree is restored from its checkpoint at open;
//! any table the checkpoint does not cover is re-scanned and re-registered.
//! Table-build inserts intervals, `remove_table` deletes them by file-number
//! prefix, and closing the store writes a final checkpoint.

pub mod secondary;

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

use crate::config::Config;
use crate::errinput;
use crate::error::Result;
use crate::extract::extract_attr;
use crate::ikey::ValueType;
use crate::Error;
use crate::itree::IntervalTree;
use crate::memtable::WriteBuffer;
use crate::sstable::{Table, TableBuilder};

pub struct Store {
    config: Config,
    itree: Option<Arc<IntervalTree>>,

    /// Serializes sequence assignment plus buffer insertion.
    write_mutex: Mutex<()>,
    last_seq: AtomicU64,
    next_file_number: AtomicU64,

    active: RwLock<Arc<WriteBuffer>>,
    immutables: RwLock<VecDeque<Arc<WriteBuffer>>>,
    /// Open tables, newest first.
    tables: RwLock<Vec<Arc<Table>>>,
}

impl Store {
    pub fn open(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        fs::create_dir_all(config.dir.join("sst"))?;

        let itree = (config.secondary_enabled() && config.interval_tree_mode()).then(|| {
            Arc::new(IntervalTree::open(
                config.interval_tree_path(),
                true,
                config.sync_threshold,
                config.id_delim,
            ))
        });

        // Discover existing tables, newest (highest file number) first.
        let mut file_numbers = Vec::new();
        for entry in fs::read_dir(config.dir.join("sst"))? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(number) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".sst"))
                .and_then(|n| n.parse::<u64>().ok())
            {
                file_numbers.push(number);
            }
        }
        file_numbers.sort_unstable_by(|a, b| b.cmp(a));

        let mut tables = Vec::with_capacity(file_numbers.len());
        let mut last_seq = 0;
        for number in &file_numbers {
            let table = Table::open(&sstable_path(&config.dir, *number), *number, &config)?;
            last_seq = last_seq.max(table.max_seq());
            tables.push(Arc::new(table));
        }

        // Any table the checkpoint does not know gets its intervals rebuilt
        // by scanning; a deleted checkpoint costs a rescan, not wrong
        // answers.
        if let Some(itree) = &itree {
            for table in &tables {
                let prefix = table.file_number().to_string();
                if !itree.contains_prefix(&prefix) {
                    info!(file_number = table.file_number(),
                          "rebuilding interval tree entries from table scan");
                    table.rebuild_intervals(itree, &config)?;
                }
            }
        }

        let next_file_number = file_numbers.first().map_or(1, |max| max + 1);
        let active = Arc::new(WriteBuffer::new(config.secondary_key.clone()));

        Ok(Self {
            config,
            itree,
            write_mutex: Mutex::new(()),
            last_seq: AtomicU64::new(last_seq),
            next_file_number: AtomicU64::new(next_file_number),
            active: RwLock::new(active),
            immutables: RwLock::new(VecDeque::new()),
            tables: RwLock::new(tables),
        })
    }

    /// Inserts a JSON record. The primary key is derived from the
    /// configured attribute; derivation failure rejects the write.
    pub fn put(&self, payload: &[u8]) -> Result<()> {
        if self.config.primary_key.is_empty() {
            return errinput!("primary key attribute not configured");
        }
        let primary_key = extract_attr(payload, &self.config.primary_key)?;
        self.write(ValueType::Value, primary_key.as_bytes(), payload)
    }

    /// Writes a tombstone for the given primary key.
    pub fn delete(&self, primary_key: &str) -> Result<()> {
        self.write(ValueType::Deletion, primary_key.as_bytes(), b"")
    }

    fn write(&self, vtype: ValueType, user_key: &[u8], payload: &[u8]) -> Result<()> {
        let _guard = self.write_mutex.lock()?;
        let seq = self.last_seq.load(Ordering::Acquire) + 1;

        let active = self.active.read()?.clone();
        active.add(seq, vtype, user_key, payload)?;
        self.last_seq.store(seq, Ordering::Release);

        if active.size() >= self.config.max_buffer_size {
            self.freeze_active()?;
        }
        Ok(())
    }

    /// Rotates the active buffer onto the immutable queue. Caller holds the
    /// write mutex.
    fn freeze_active(&self) -> Result<()> {
        let fresh = Arc::new(WriteBuffer::new(self.config.secondary_key.clone()));
        let old = {
            let mut active = self.active.write()?;
            let old = std::mem::replace(&mut *active, fresh);
            old.freeze()?;
            old
        };
        self.immutables.write()?.push_back(old);
        Ok(())
    }

    /// Returns the payload of the newest live version of the key, or
    /// NotFound when the key is absent or tombstoned.
    pub fn get(&self, primary_key: &str) -> Result<Vec<u8>> {
        let snapshot = self.last_sequence();
        match self.read_internal(primary_key.as_bytes(), snapshot)? {
            Some((tag, payload)) if ValueType::from_tag(tag)? == ValueType::Value => Ok(payload),
            _ => Err(Error::NotFound),
        }
    }

    /// Newest `(tag, payload)` for a user key visible at `snapshot`,
    /// consulting every source newest first. Also the re-read hook the
    /// secondary evaluator verifies candidates through.
    pub(crate) fn read_internal(
        &self,
        user_key: &[u8],
        snapshot: u64,
    ) -> Result<Option<(u64, Vec<u8>)>> {
        let active = self.active.read()?.clone();
        if let Some(found) = active.get(user_key, snapshot)? {
            return Ok(Some(found));
        }

        let immutables: Vec<Arc<WriteBuffer>> =
            self.immutables.read()?.iter().rev().cloned().collect();
        for buffer in immutables {
            if let Some(found) = buffer.get(user_key, snapshot)? {
                return Ok(Some(found));
            }
        }

        let tables: Vec<Arc<Table>> = self.tables.read()?.iter().cloned().collect();
        for table in tables {
            if let Some(found) = table.get(user_key, snapshot)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Flushes the oldest frozen buffer into an SSTable, freezing the
    /// active buffer first if nothing is queued. Returns false when there
    /// was nothing to flush.
    pub fn flush(&self) -> Result<bool> {
        let _guard = self.write_mutex.lock()?;

        if self.immutables.read()?.is_empty() {
            if self.active.read()?.is_empty() {
                return Ok(false);
            }
            self.freeze_active()?;
        }
        let Some(buffer) = self.immutables.read()?.front().cloned() else {
            return Ok(false);
        };

        let file_number = self.next_file_number.fetch_add(1, Ordering::SeqCst);
        let path = sstable_path(&self.config.dir, file_number);

        let mut builder =
            TableBuilder::create(&path, file_number, &self.config, self.itree.as_deref())?;
        for (ikey, payload) in buffer.iter() {
            builder.add(&ikey, &payload)?;
        }
        let entries = builder.num_entries();
        let file_size = builder.finish()?;

        let table = Arc::new(Table::open(&path, file_number, &self.config)?);
        self.tables.write()?.insert(0, table);
        self.immutables.write()?.pop_front();

        info!(file_number, entries, file_size, "flushed write buffer to sstable");
        Ok(true)
    }

    /// Drops a table from the store, deleting its interval tree entries by
    /// file-number prefix. The hook a compaction would call after merging
    /// the table away. Returns false if the table is not registered.
    pub fn remove_table(&self, file_number: u64) -> Result<bool> {
        let removed = {
            let mut tables = self.tables.write()?;
            let before = tables.len();
            tables.retain(|table| table.file_number() != file_number);
            tables.len() != before
        };
        if removed {
            if let Some(itree) = &self.itree {
                let deleted = itree.delete_all_with_prefix(&file_number.to_string());
                info!(file_number, deleted, "dropped table and its block intervals");
            }
        }
        Ok(removed)
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_seq.load(Ordering::Acquire)
    }

    pub fn num_tables(&self) -> usize {
        self.tables.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The store's interval tree, present in interval tree mode.
    pub fn interval_tree(&self) -> Option<&Arc<IntervalTree>> {
        self.itree.as_ref()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Some(itree) = &self.itree {
            if let Err(e) = itree.sync() {
                warn!(error = %e, "final interval tree checkpoint failed");
            }
        }
    }
}

fn sstable_path(dir: &std::path::Path, file_number: u64) -> PathBuf {
    dir.join("sst").join(format!("{file_number:08}.sst"))
}
