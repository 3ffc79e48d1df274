//! SSTable build and read paths.
//!
//! The builder cuts prefix-compressed data blocks at the configured size
//! and, block by block, tracks the secondary-value range and maximum
//! sequence number of what it wrote. At each block boundary that metadata
//! goes either into the global interval tree (keyed by
//! `<file_number>+<last user key>`) or into an in-file interval block
//! parallel to the index block, depending on the store mode. Secondary
//! composite keys feed a per-block bloom filter alongside the primary one.
//!
//! The reader decodes the index, interval, metaindex, and filter blocks at
//! open and serves the primary point-read path plus the secondary
//! evaluation paths the query evaluator drives.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::extract::extract_attr;
use crate::ikey::{
    composite_key, icmp, seek_key, split_internal, tag_sequence, user_key, ValueType,
};
use crate::itree::IntervalTree;
use crate::sstable::block::{Block, Builder, DATA_RESTART_INTERVAL};
use crate::sstable::filter::{FilterBlockBuilder, FilterBlockReader, FILTER_POLICY_NAME};
use crate::sstable::format::{append_block, read_block, BlockHandle, Footer};

/// Metaindex entry carrying table-wide stats: max sequence number and the
/// table-level secondary range.
const PROPERTIES_KEY: &str = "jotdb.properties";

/// Saver callback driven by block scans: `(internal key, payload)`.
pub type Saver<'a> = dyn FnMut(&[u8], &[u8]) -> Result<()> + 'a;

pub struct TableBuilder<'a> {
    file: File,
    offset: u64,
    file_number: u64,
    config: &'a Config,
    itree: Option<&'a IntervalTree>,

    data_block: Builder,
    index_block: Builder,
    interval_block: Builder,
    filter_block: Option<FilterBlockBuilder>,
    secondary_filter_block: Option<FilterBlockBuilder>,

    last_key: Vec<u8>,
    num_entries: u64,
    pending_index_entry: bool,
    pending_handle: BlockHandle,

    // Secondary range of the block being built.
    min_sec: String,
    max_sec: String,
    block_has_sec: bool,
    block_max_seq: u64,

    // Table-level accumulation.
    smallest_sec: String,
    largest_sec: String,
    table_has_sec: bool,
    table_max_seq: u64,
}

impl<'a> TableBuilder<'a> {
    pub fn create(
        path: &Path,
        file_number: u64,
        config: &'a Config,
        itree: Option<&'a IntervalTree>,
    ) -> Result<Self> {
        let file = File::create(path)?;
        let filters = config.filter_bits_per_key > 0;
        Ok(Self {
            file,
            offset: 0,
            file_number,
            config,
            itree,
            data_block: Builder::new(DATA_RESTART_INTERVAL),
            index_block: Builder::new(1),
            interval_block: Builder::new(1),
            filter_block: filters.then(|| FilterBlockBuilder::new(config.filter_bits_per_key)),
            secondary_filter_block: (filters && config.secondary_enabled())
                .then(|| FilterBlockBuilder::new(config.filter_bits_per_key)),
            last_key: Vec::new(),
            num_entries: 0,
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
            min_sec: String::new(),
            max_sec: String::new(),
            block_has_sec: false,
            block_max_seq: 0,
            smallest_sec: String::new(),
            largest_sec: String::new(),
            table_has_sec: false,
            table_max_seq: 0,
        })
    }

    /// Adds one entry. Keys must arrive in internal-key order.
    pub fn add(&mut self, ikey: &[u8], payload: &[u8]) -> Result<()> {
        debug_assert!(
            self.num_entries == 0 || icmp(&self.last_key, ikey) == std::cmp::Ordering::Less,
            "entries added out of order"
        );

        if self.pending_index_entry {
            self.emit_pending_index_entry();
        }

        let (ukey, tag) = split_internal(ikey)?;
        if let Some(filter) = &mut self.filter_block {
            filter.add_key(ukey.to_vec());
        }

        // Tombstones and unextractable payloads stay out of the secondary
        // structures but still advance the block's sequence bound.
        if self.config.secondary_enabled() {
            if let Ok(sec_value) = extract_attr(payload, &self.config.secondary_key) {
                if let Some(filter) = &mut self.secondary_filter_block {
                    filter.add_key(composite_key(&sec_value, tag));
                    // The bare value is what tag-less point probes test.
                    filter.add_key(sec_value.clone().into_bytes());
                }
                if !self.block_has_sec || sec_value < self.min_sec {
                    self.min_sec = sec_value.clone();
                }
                if !self.block_has_sec || sec_value > self.max_sec {
                    self.max_sec = sec_value;
                }
                self.block_has_sec = true;
            }
        }
        let seq = tag_sequence(tag);
        self.block_max_seq = self.block_max_seq.max(seq);
        self.table_max_seq = self.table_max_seq.max(seq);

        self.data_block.add_entry(ikey, payload);
        self.last_key = ikey.to_vec();
        self.num_entries += 1;

        if self.data_block.size_estimate() >= self.config.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let contents = std::mem::replace(&mut self.data_block, Builder::new(DATA_RESTART_INTERVAL))
            .finish();
        self.pending_handle = append_block(&mut self.file, &mut self.offset, &contents)?;
        self.pending_index_entry = true;

        if let Some(filter) = &mut self.filter_block {
            filter.start_block(self.offset);
        }
        if let Some(filter) = &mut self.secondary_filter_block {
            filter.start_block(self.offset);
        }
        Ok(())
    }

    /// Records the finished block's interval and index entry. Called lazily
    /// on the next `add` or at `finish`.
    fn emit_pending_index_entry(&mut self) {
        if self.config.interval_tree_mode() {
            if let Some(itree) = self.itree {
                let id = format!(
                    "{}{}{}",
                    self.file_number,
                    self.config.id_delim,
                    String::from_utf8_lossy(user_key(&self.last_key)),
                );
                itree.insert_interval(&id, &self.min_sec, &self.max_sec, self.block_max_seq);
            }
        } else {
            self.interval_block
                .add_entry(self.min_sec.as_bytes(), self.max_sec.as_bytes());
        }

        if self.block_has_sec {
            if !self.table_has_sec || self.min_sec < self.smallest_sec {
                self.smallest_sec = self.min_sec.clone();
            }
            if !self.table_has_sec || self.max_sec > self.largest_sec {
                self.largest_sec = self.max_sec.clone();
            }
            self.table_has_sec = true;
        }

        self.min_sec.clear();
        self.max_sec.clear();
        self.block_has_sec = false;
        self.block_max_seq = 0;

        self.index_block
            .add_entry(&self.last_key, &self.pending_handle.encoded());
        self.pending_index_entry = false;
    }

    /// Writes the meta sections and footer. Returns the final file size.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_data_block()?;
        if self.pending_index_entry {
            self.emit_pending_index_entry();
            // The last block's interval is on record; checkpoint the tree
            // so a crash before the next threshold does not lose the table.
            if let Some(itree) = self.itree {
                if let Err(e) = itree.sync() {
                    warn!(error = %e, "interval tree checkpoint after table build failed");
                }
            }
        }

        let filter_handle = match self.filter_block.take() {
            Some(filter) => Some(append_block(
                &mut self.file,
                &mut self.offset,
                &filter.finish(),
            )?),
            None => None,
        };
        let secondary_filter_handle = match self.secondary_filter_block.take() {
            Some(filter) => Some(append_block(
                &mut self.file,
                &mut self.offset,
                &filter.finish(),
            )?),
            None => None,
        };

        // Metaindex block: filter handles plus the table properties entry,
        // keys in lexicographic order.
        let mut metaindex = Builder::new(1);
        if let Some(handle) = filter_handle {
            metaindex.add_entry(
                format!("filter.{FILTER_POLICY_NAME}").as_bytes(),
                &handle.encoded(),
            );
        }
        metaindex.add_entry(PROPERTIES_KEY.as_bytes(), &self.encode_properties());
        if let Some(handle) = secondary_filter_handle {
            metaindex.add_entry(
                format!("secondaryfilter.{FILTER_POLICY_NAME}").as_bytes(),
                &handle.encoded(),
            );
        }
        let metaindex_handle =
            append_block(&mut self.file, &mut self.offset, &metaindex.finish())?;

        let interval_handle = if !self.config.interval_tree_mode() {
            let contents = std::mem::replace(&mut self.interval_block, Builder::new(1)).finish();
            Some(append_block(&mut self.file, &mut self.offset, &contents)?)
        } else {
            None
        };

        let contents = std::mem::replace(&mut self.index_block, Builder::new(1)).finish();
        let index_handle = append_block(&mut self.file, &mut self.offset, &contents)?;

        let footer = Footer {
            metaindex: metaindex_handle,
            index: index_handle,
            interval: interval_handle,
        };
        let encoding = footer.encode();
        use std::io::Write;
        self.file.write_all(&encoding)?;
        self.offset += encoding.len() as u64;

        self.file.sync_all()?;
        Ok(self.offset)
    }

    fn encode_properties(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.write_u64::<BigEndian>(self.table_max_seq).unwrap();
        buffer.write_u8(self.table_has_sec as u8).unwrap();
        for field in [&self.smallest_sec, &self.largest_sec] {
            buffer
                .write_u32::<BigEndian>(field.len() as u32)
                .unwrap();
            buffer.extend_from_slice(field.as_bytes());
        }
        buffer
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }
}

/// An open, immutable SSTable.
pub struct Table {
    file: File,
    file_number: u64,
    paranoid: bool,
    /// `(last internal key, handle)` per data block, in block order.
    index_entries: Vec<(Vec<u8>, BlockHandle)>,
    /// `(min, max)` secondary range per data block, parallel to
    /// `index_entries`. None in interval tree mode or after corruption
    /// (read path then degrades to scanning every block).
    interval_entries: Option<Vec<(String, String)>>,
    primary_filter: Option<FilterBlockReader>,
    secondary_filter: Option<FilterBlockReader>,
    max_seq: u64,
    /// Table-level secondary range; None when no record in the table
    /// carried a secondary value.
    sec_range: Option<(String, String)>,
}

impl Table {
    pub fn open(path: &Path, file_number: u64, config: &Config) -> Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();

        let interval_mode = !config.interval_tree_mode();
        let footer = Footer::read_from(&file, file_size, interval_mode)?;

        // The index block is load-bearing; its checksum is always checked.
        let index_data = read_block(&file, footer.index, true)?;
        let index_block = Arc::new(Block::new(index_data)?);
        let mut index_entries = Vec::new();
        for entry in index_block.iter() {
            let (key, value) = entry?;
            index_entries.push((key, BlockHandle::decode_from(&value)?));
        }

        let interval_entries = match footer.interval {
            Some(handle) => match Self::read_interval_block(&file, handle, index_entries.len()) {
                Ok(entries) => Some(entries),
                Err(e) => {
                    warn!(file_number, error = %e,
                          "corrupt interval block, falling back to full block scans");
                    None
                }
            },
            None => None,
        };

        let mut table = Self {
            file,
            file_number,
            paranoid: config.paranoid_checks,
            index_entries,
            interval_entries,
            primary_filter: None,
            secondary_filter: None,
            max_seq: 0,
            sec_range: None,
        };
        table.read_meta(&footer);
        Ok(table)
    }

    fn read_interval_block(
        file: &File,
        handle: BlockHandle,
        expected_len: usize,
    ) -> Result<Vec<(String, String)>> {
        let data = read_block(file, handle, true)?;
        let block = Arc::new(Block::new(data)?);
        let mut entries = Vec::new();
        for entry in block.iter() {
            let (min, max) = entry?;
            entries.push((
                String::from_utf8_lossy(&min).into_owned(),
                String::from_utf8_lossy(&max).into_owned(),
            ));
        }
        if entries.len() != expected_len {
            return crate::errcorrupt!(
                "interval block has {} entries for {expected_len} data blocks",
                entries.len()
            );
        }
        Ok(entries)
    }

    /// Loads the filter blocks and table properties through the metaindex.
    /// Meta info is optional: failures degrade, they never fail the open.
    fn read_meta(&mut self, footer: &Footer) {
        let meta = match read_block(&self.file, footer.metaindex, true)
            .and_then(|data| Block::new(data).map(Arc::new))
        {
            Ok(block) => block,
            Err(e) => {
                warn!(file_number = self.file_number, error = %e,
                      "unreadable metaindex block, serving without filters");
                return;
            }
        };
        let entries = match meta.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(file_number = self.file_number, error = %e,
                      "corrupt metaindex block, serving without filters");
                return;
            }
        };

        for (key, value) in entries {
            match key.as_slice() {
                k if k == format!("filter.{FILTER_POLICY_NAME}").as_bytes() => {
                    self.primary_filter = self.read_filter(&value);
                }
                k if k == format!("secondaryfilter.{FILTER_POLICY_NAME}").as_bytes() => {
                    self.secondary_filter = self.read_filter(&value);
                }
                k if k == PROPERTIES_KEY.as_bytes() => {
                    if let Err(e) = self.decode_properties(&value) {
                        warn!(file_number = self.file_number, error = %e,
                              "corrupt table properties");
                    }
                }
                _ => {}
            }
        }
    }

    fn read_filter(&self, handle_encoding: &[u8]) -> Option<FilterBlockReader> {
        let handle = BlockHandle::decode_from(handle_encoding).ok()?;
        match read_block(&self.file, handle, true).and_then(|data| FilterBlockReader::new(&data)) {
            Ok(reader) => Some(reader),
            Err(e) => {
                warn!(file_number = self.file_number, error = %e,
                      "corrupt filter block, scanning without it");
                None
            }
        }
    }

    fn decode_properties(&mut self, mut value: &[u8]) -> Result<()> {
        self.max_seq = value.read_u64::<BigEndian>()?;
        let has_sec = value.read_u8()? != 0;
        let mut fields = Vec::with_capacity(2);
        for _ in 0..2 {
            let len = value.read_u32::<BigEndian>()? as usize;
            if len > value.len() {
                return crate::errcorrupt!("truncated table properties");
            }
            let (field, rest) = value.split_at(len);
            fields.push(String::from_utf8_lossy(field).into_owned());
            value = rest;
        }
        if has_sec {
            self.sec_range = Some((fields.swap_remove(0), fields.pop().unwrap()));
        }
        Ok(())
    }

    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    pub fn max_seq(&self) -> u64 {
        self.max_seq
    }

    /// Table-level `(smallest_sec, largest_sec)` for file pruning.
    pub fn sec_range(&self) -> Option<(&str, &str)> {
        self.sec_range
            .as_ref()
            .map(|(lo, hi)| (lo.as_str(), hi.as_str()))
    }

    /// Primary point read: newest version of `key` visible at `snapshot`.
    pub fn get(&self, key: &[u8], snapshot: u64) -> Result<Option<(u64, Vec<u8>)>> {
        let target = seek_key(key, snapshot);
        let idx = self
            .index_entries
            .partition_point(|(last_key, _)| icmp(last_key, &target) == std::cmp::Ordering::Less);
        let Some((_, handle)) = self.index_entries.get(idx) else {
            return Ok(None);
        };

        if let Some(filter) = &self.primary_filter {
            if !filter.key_may_match(handle.offset, key) {
                return Ok(None);
            }
        }

        let block = self.load_block(*handle)?;
        let mut iter = block.iter();
        iter.seek(&target, icmp)?;
        if let Some(entry) = iter.next() {
            let (ikey, payload) = entry?;
            let (found_key, tag) = split_internal(&ikey)?;
            if found_key == key {
                return Ok(Some((tag, payload)));
            }
        }
        Ok(None)
    }

    /// Point-query evaluation in interval-block mode: walk the index and
    /// interval blocks in lockstep, prune blocks whose range misses `skey`,
    /// probe the secondary filter with the bare key, scan survivors.
    pub fn evaluate_point(&self, skey: &str, saver: &mut Saver) -> Result<()> {
        match &self.interval_entries {
            Some(intervals) => {
                for ((_, handle), (min, max)) in self.index_entries.iter().zip(intervals) {
                    if skey < min.as_str() || skey > max.as_str() {
                        continue;
                    }
                    if let Some(filter) = &self.secondary_filter {
                        if !filter.key_may_match(handle.offset, skey.as_bytes()) {
                            continue;
                        }
                    }
                    self.scan_block(*handle, saver)?;
                }
                Ok(())
            }
            None => self.scan_all_blocks(saver),
        }
    }

    /// Range-query evaluation in interval-block mode. The filter is not
    /// consulted: the query is a range, not a point.
    pub fn evaluate_range(&self, low: &str, high: &str, saver: &mut Saver) -> Result<()> {
        match &self.interval_entries {
            Some(intervals) => {
                for ((_, handle), (min, max)) in self.index_entries.iter().zip(intervals) {
                    if low > max.as_str() || high < min.as_str() {
                        continue;
                    }
                    self.scan_block(*handle, saver)?;
                }
                Ok(())
            }
            None => self.scan_all_blocks(saver),
        }
    }

    /// Scans the single block identified by its last user key, as recorded
    /// in an interval tree id. Point queries probe the secondary filter
    /// first. A block the index no longer knows is a stale interval and is
    /// skipped.
    pub fn evaluate_block(
        &self,
        last_user_key: &str,
        point_skey: Option<&str>,
        saver: &mut Saver,
    ) -> Result<()> {
        let target = last_user_key.as_bytes();
        let idx = self
            .index_entries
            .partition_point(|(last_key, _)| user_key(last_key) < target);
        let Some((last_key, handle)) = self.index_entries.get(idx) else {
            return Ok(());
        };
        if user_key(last_key) != target {
            return Ok(());
        }

        if let Some(skey) = point_skey {
            if let Some(filter) = &self.secondary_filter {
                if !filter.key_may_match(handle.offset, skey.as_bytes()) {
                    return Ok(());
                }
            }
        }
        self.scan_block(*handle, saver)
    }

    fn scan_all_blocks(&self, saver: &mut Saver) -> Result<()> {
        for (_, handle) in &self.index_entries {
            self.scan_block(*handle, saver)?;
        }
        Ok(())
    }

    fn scan_block(&self, handle: BlockHandle, saver: &mut Saver) -> Result<()> {
        let block = self.load_block(handle)?;
        for entry in block.iter() {
            let (ikey, payload) = entry?;
            saver(&ikey, &payload)?;
        }
        Ok(())
    }

    fn load_block(&self, handle: BlockHandle) -> Result<Arc<Block>> {
        let data = read_block(&self.file, handle, self.paranoid)?;
        Ok(Arc::new(Block::new(data)?))
    }

    /// Recomputes every block's `(min, max, max_seq)` interval by scanning
    /// and re-registers them in the tree. Used at open when the checkpoint
    /// was lost for this table.
    pub fn rebuild_intervals(&self, itree: &IntervalTree, config: &Config) -> Result<()> {
        for (last_key, handle) in &self.index_entries {
            let block = self.load_block(*handle)?;
            let mut min_sec = String::new();
            let mut max_sec = String::new();
            let mut has_sec = false;
            let mut max_block_seq = 0u64;

            for entry in block.iter() {
                let (ikey, payload) = entry?;
                let (_, tag) = split_internal(&ikey)?;
                max_block_seq = max_block_seq.max(tag_sequence(tag));
                if ValueType::from_tag(tag)? == ValueType::Deletion {
                    continue;
                }
                if let Ok(sec_value) = extract_attr(&payload, &config.secondary_key) {
                    if !has_sec || sec_value < min_sec {
                        min_sec = sec_value.clone();
                    }
                    if !has_sec || sec_value > max_sec {
                        max_sec = sec_value;
                    }
                    has_sec = true;
                }
            }

            let id = format!(
                "{}{}{}",
                self.file_number,
                config.id_delim,
                String::from_utf8_lossy(user_key(last_key)),
            );
            itree.insert_interval(&id, &min_sec, &max_sec, max_block_seq);
        }
        Ok(())
    }
}
