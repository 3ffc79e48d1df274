//! 2-D interval tree with top-K.
//!
//! The process-wide index of data-block secondary ranges: one interval per
//! data block across all live SSTables, keyed by a compound id
//! `<file_number><delim><last_user_key>` so a whole table's intervals can be
//! dropped in one call when compaction retires the table.
//!
//! The tree is periodically checkpointed to a plain file and rebuilt from
//! table scans when the file is missing; losing the checkpoint costs a
//! rebuild, never a wrong query.

mod checkpoint;
mod iter;
mod tree;

use std::path::PathBuf;
use std::sync::Mutex;

use itertools::Itertools;
use tracing::{error, warn};

use crate::error::Result;

pub use iter::TopKIterator;
pub use tree::Interval;

use iter::IterState;
use tree::Tree;

pub struct IntervalTree {
    inner: Mutex<Inner>,
}

struct Inner {
    pub tree: Tree,
    pub iter: Option<IterState>,
    iter_token: u64,
    sync_path: PathBuf,
    sync_threshold: u32,
    sync_counter: u32,
}

impl IntervalTree {
    /// Opens the tree backed by the given checkpoint file. With
    /// `restore = true` an existing readable checkpoint is replayed; a
    /// missing or corrupt one is logged and skipped, leaving the tree to be
    /// rebuilt from table scans.
    pub fn open(
        sync_path: impl Into<PathBuf>,
        restore: bool,
        sync_threshold: u32,
        id_delim: char,
    ) -> Self {
        let sync_path = sync_path.into();
        let mut tree = Tree::new(id_delim);

        if restore && sync_path.exists() {
            match checkpoint::read(&sync_path) {
                Ok(intervals) => {
                    for interval in intervals {
                        tree.insert(interval);
                    }
                }
                Err(e) => {
                    warn!(path = %sync_path.display(), error = %e,
                          "Unreadable interval tree checkpoint, rebuilding from tables");
                }
            }
        }

        Self {
            inner: Mutex::new(Inner {
                tree,
                iter: None,
                iter_token: 0,
                sync_path,
                sync_threshold,
                sync_counter: 0,
            }),
        }
    }

    /// Inserts a block interval. An empty id is logged and dropped; a
    /// duplicate id replaces the previous interval. Cancels any live
    /// iterator and checkpoints once the mutation counter passes the
    /// threshold.
    pub fn insert_interval(&self, id: &str, low: &str, high: &str, timestamp: u64) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(e) => e.into_inner(),
        };
        inner.iter = None;

        if id.is_empty() {
            error!("empty interval id, dropping insert");
            return;
        }
        inner
            .tree
            .insert(Interval::new(id, low, high, timestamp));
        inner.bump_sync_counter();
    }

    /// Deletes the interval with the given id, if present.
    pub fn delete_interval(&self, id: &str) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(e) => e.into_inner(),
        };
        inner.iter = None;

        let deleted = inner.tree.delete(id);
        if deleted {
            inner.bump_sync_counter();
        }
        deleted
    }

    /// Deletes every interval whose id carries the given prefix. The hook
    /// compaction calls when it drops a table. Returns the number removed.
    pub fn delete_all_with_prefix(&self, prefix: &str) -> usize {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(e) => e.into_inner(),
        };
        inner.iter = None;

        let deleted = inner.tree.delete_all_with_prefix(prefix);
        if deleted > 0 {
            inner.bump_sync_counter();
        }
        deleted
    }

    /// Looks an interval up by its compound id.
    pub fn get_interval(&self, id: &str) -> Option<Interval> {
        let inner = self.inner.lock().ok()?;
        inner.tree.get(id).cloned()
    }

    /// True if any interval id carries the given prefix.
    pub fn contains_prefix(&self, prefix: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.tree.contains_prefix(prefix))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.tree.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn height(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.tree.height())
            .unwrap_or(0)
    }

    /// Eagerly collects every interval intersecting [low, high], sorted by
    /// timestamp descending.
    pub fn top_k(&self, low: &str, high: &str) -> Vec<Interval> {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(e) => e.into_inner(),
        };
        let mut found = Vec::new();
        inner.tree.search(low, high, &mut found);
        found
            .into_iter()
            .sorted_by(|a, b| b.timestamp.cmp(&a.timestamp))
            .collect()
    }

    /// Starts the lazy top-K iterator. The tree carries at most one: while
    /// another is live, construction fails with `QueryInterrupted` and the
    /// caller retries once the holder finishes or drops.
    pub fn top_k_iter(&self, low: &str, high: &str) -> Result<TopKIterator<'_>> {
        let mut inner = self.inner.lock()?;
        let inner = &mut *inner;
        if inner.iter.is_some() {
            return Err(crate::Error::QueryInterrupted);
        }
        inner.iter_token += 1;
        let token = inner.iter_token;
        inner.iter = Some(IterState::start(
            &inner.tree,
            token,
            low.to_string(),
            high.to_string(),
        ));
        Ok(TopKIterator::new(self, token))
    }

    /// Checkpoints every interval to the sync file, rewriting it in full.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.sync_counter = 0;
        let intervals: Vec<Interval> = inner.tree.intervals().cloned().collect();
        checkpoint::write(&inner.sync_path, &intervals)
    }
}

impl Inner {
    /// Counts a mutation toward the periodic checkpoint; a write failure is
    /// logged and the tree stays authoritative in memory.
    fn bump_sync_counter(&mut self) {
        self.sync_counter += 1;
        if self.sync_counter > self.sync_threshold {
            self.sync_counter = 0;
            let intervals: Vec<Interval> = self.tree.intervals().cloned().collect();
            if let Err(e) = checkpoint::write(&self.sync_path, &intervals) {
                warn!(path = %self.sync_path.display(), error = %e,
                      "interval tree checkpoint failed");
            }
        }
    }
}
