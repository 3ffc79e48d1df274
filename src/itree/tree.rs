//! Arena-backed augmented red-black tree over string intervals.
//!
//! Nodes live in a `Vec` and reference each other by index; index 0 is the
//! nil sentinel, so parent/child links never need `Option` and the
//! Cormen-style rotation and transplant code moves plain indices. Freed
//! slots are recycled through a free list.
//!
//! Each node is keyed by its interval's low endpoint and carries two
//! subtree aggregates: `max_high` (lexicographic maximum of interval highs)
//! and `max_timestamp` (maximum block sequence number). Both are maintained
//! through insert, delete, and rotation; the top-K iterator's pruning and
//! ordering depend on them.

use std::collections::{HashMap, HashSet};

/// A block's secondary-value range in interval-timestamp space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub id: String,
    pub low: String,
    pub high: String,
    pub timestamp: u64,
}

impl Interval {
    pub fn new(
        id: impl Into<String>,
        low: impl Into<String>,
        high: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: id.into(),
            low: low.into(),
            high: high.into(),
            timestamp,
        }
    }

    /// Inclusive intersection: point overlaps count.
    pub fn overlaps(&self, low: &str, high: &str) -> bool {
        if self.low.as_str() < low {
            self.high.as_str() >= low
        } else {
            high >= self.low.as_str()
        }
    }
}

pub(super) const NIL: usize = 0;

#[derive(Debug)]
pub(super) struct Node {
    pub interval: Interval,
    pub is_red: bool,
    pub max_high: String,
    pub max_timestamp: u64,
    pub left: usize,
    pub right: usize,
    pub parent: usize,
}

/// The tree proper plus its identity maps. Synchronization lives a level up.
pub(super) struct Tree {
    nodes: Vec<Node>,
    free: Vec<usize>,
    pub root: usize,
    /// Compound id -> node index.
    storage: HashMap<String, usize>,
    /// Id prefix -> set of suffixes, for prefix-wide deletion.
    ids: HashMap<String, HashSet<String>>,
    id_delim: char,
}

impl Tree {
    pub fn new(id_delim: char) -> Self {
        let nil = Node {
            interval: Interval::new("", "", "", 0),
            is_red: false,
            max_high: String::new(),
            max_timestamp: 0,
            left: NIL,
            right: NIL,
            parent: NIL,
        };
        Self {
            nodes: vec![nil],
            free: Vec::new(),
            root: NIL,
            storage: HashMap::new(),
            ids: HashMap::new(),
            id_delim,
        }
    }

    pub fn node(&self, x: usize) -> &Node {
        &self.nodes[x]
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    fn split_id<'a>(&self, id: &'a str) -> (&'a str, &'a str) {
        id.split_once(self.id_delim).unwrap_or((id, ""))
    }

    fn join_id(&self, prefix: &str, suffix: &str) -> String {
        if suffix.is_empty() {
            prefix.to_string()
        } else {
            format!("{prefix}{}{suffix}", self.id_delim)
        }
    }

    /// Inserts an interval, replacing any existing one with the same id.
    /// Returns false when the id is empty.
    pub fn insert(&mut self, interval: Interval) -> bool {
        if interval.id.is_empty() {
            return false;
        }

        let (prefix, suffix) = {
            let (p, s) = self.split_id(&interval.id);
            (p.to_string(), s.to_string())
        };

        if self
            .ids
            .get(&prefix)
            .is_some_and(|suffixes| suffixes.contains(&suffix))
        {
            self.delete(&interval.id);
        }
        self.ids.entry(prefix).or_default().insert(suffix);

        let z = self.alloc(interval);
        self.storage.insert(self.nodes[z].interval.id.clone(), z);
        self.tree_insert(z);
        true
    }

    /// Deletes the interval with the given id. Returns false if absent.
    pub fn delete(&mut self, id: &str) -> bool {
        let Some(&z) = self.storage.get(id) else {
            return false;
        };

        let (prefix, suffix) = {
            let (p, s) = self.split_id(id);
            (p.to_string(), s.to_string())
        };
        if let Some(suffixes) = self.ids.get_mut(&prefix) {
            suffixes.remove(&suffix);
            if suffixes.is_empty() {
                self.ids.remove(&prefix);
            }
        }

        self.tree_delete(z);
        self.storage.remove(id);
        self.release(z);
        true
    }

    /// Deletes every interval whose id carries the given prefix. Returns the
    /// number removed.
    pub fn delete_all_with_prefix(&mut self, prefix: &str) -> usize {
        let Some(suffixes) = self.ids.get(prefix) else {
            return 0;
        };
        let doomed: Vec<String> = suffixes
            .iter()
            .map(|suffix| self.join_id(prefix, suffix))
            .collect();
        for id in &doomed {
            self.delete(id);
        }
        doomed.len()
    }

    pub fn get(&self, id: &str) -> Option<&Interval> {
        self.storage.get(id).map(|&idx| &self.nodes[idx].interval)
    }

    pub fn contains_prefix(&self, prefix: &str) -> bool {
        self.ids.contains_key(prefix)
    }

    pub fn intervals(&self) -> impl Iterator<Item = &Interval> {
        self.storage.values().map(|&idx| &self.nodes[idx].interval)
    }

    /// Collects every interval intersecting [low, high], pruning subtrees
    /// whose max_high falls short of the query's low endpoint.
    pub fn search(&self, low: &str, high: &str, out: &mut Vec<Interval>) {
        self.search_from(self.root, low, high, out);
    }

    fn search_from(&self, x: usize, low: &str, high: &str, out: &mut Vec<Interval>) {
        if x == NIL {
            return;
        }
        let node = &self.nodes[x];
        if low > node.max_high.as_str() {
            return;
        }
        if node.left != NIL {
            self.search_from(node.left, low, high, out);
        }
        if node.interval.overlaps(low, high) {
            out.push(node.interval.clone());
        }
        if high < node.interval.low.as_str() {
            return;
        }
        if node.right != NIL {
            self.search_from(node.right, low, high, out);
        }
    }

    pub fn height(&self) -> usize {
        self.height_from(self.root)
    }

    fn height_from(&self, x: usize) -> usize {
        if x == NIL {
            return 0;
        }
        let hl = self.height_from(self.nodes[x].left);
        let hr = self.height_from(self.nodes[x].right);
        hl.max(hr) + 1
    }

    // ---- Node arena ----

    fn alloc(&mut self, interval: Interval) -> usize {
        let node = Node {
            max_high: interval.high.clone(),
            max_timestamp: interval.timestamp,
            interval,
            is_red: true,
            left: NIL,
            right: NIL,
            parent: NIL,
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) {
        self.free.push(idx);
    }

    // ---- Red-black machinery ----

    fn tree_insert(&mut self, z: usize) {
        let z_low = self.nodes[z].interval.low.clone();
        let z_high = self.nodes[z].max_high.clone();
        let z_ts = self.nodes[z].max_timestamp;

        let mut y = NIL;
        let mut x = self.root;
        while x != NIL {
            y = x;
            // Fold the new node's endpoint into every ancestor on the way down.
            if self.nodes[y].max_high < z_high {
                self.nodes[y].max_high = z_high.clone();
            }
            if self.nodes[y].max_timestamp < z_ts {
                self.nodes[y].max_timestamp = z_ts;
            }
            x = if z_low < self.nodes[x].interval.low {
                self.nodes[x].left
            } else {
                self.nodes[x].right
            };
        }

        self.nodes[z].parent = y;
        if y == NIL {
            self.root = z;
        } else if z_low < self.nodes[y].interval.low {
            self.nodes[y].left = z;
        } else {
            self.nodes[y].right = z;
        }
        self.nodes[z].left = NIL;
        self.nodes[z].right = NIL;
        self.nodes[z].is_red = true;

        self.insert_fixup(z);
    }

    fn insert_fixup(&mut self, mut z: usize) {
        while self.nodes[self.nodes[z].parent].is_red {
            let parent = self.nodes[z].parent;
            let grandparent = self.nodes[parent].parent;

            if parent == self.nodes[grandparent].left {
                let uncle = self.nodes[grandparent].right;
                if self.nodes[uncle].is_red {
                    self.nodes[parent].is_red = false;
                    self.nodes[uncle].is_red = false;
                    self.nodes[grandparent].is_red = true;
                    z = grandparent;
                } else {
                    if z == self.nodes[parent].right {
                        z = parent;
                        self.left_rotate(z);
                    }
                    let parent = self.nodes[z].parent;
                    let grandparent = self.nodes[parent].parent;
                    self.nodes[parent].is_red = false;
                    self.nodes[grandparent].is_red = true;
                    self.right_rotate(grandparent);
                }
            } else {
                let uncle = self.nodes[grandparent].left;
                if self.nodes[uncle].is_red {
                    self.nodes[parent].is_red = false;
                    self.nodes[uncle].is_red = false;
                    self.nodes[grandparent].is_red = true;
                    z = grandparent;
                } else {
                    if z == self.nodes[parent].left {
                        z = parent;
                        self.right_rotate(z);
                    }
                    let parent = self.nodes[z].parent;
                    let grandparent = self.nodes[parent].parent;
                    self.nodes[parent].is_red = false;
                    self.nodes[grandparent].is_red = true;
                    self.left_rotate(grandparent);
                }
            }
        }
        let root = self.root;
        self.nodes[root].is_red = false;
    }

    fn tree_delete(&mut self, z: usize) {
        let mut y = z;
        let mut y_orig_is_red = self.nodes[y].is_red;
        let x;

        if self.nodes[z].left == NIL {
            x = self.nodes[z].right;
            self.transplant(z, x);
        } else if self.nodes[z].right == NIL {
            x = self.nodes[z].left;
            self.transplant(z, x);
        } else {
            y = self.minimum(self.nodes[z].right);
            y_orig_is_red = self.nodes[y].is_red;
            x = self.nodes[y].right;
            if self.nodes[y].parent == z {
                self.nodes[x].parent = y;
            } else {
                self.transplant(y, x);
                self.nodes[y].right = self.nodes[z].right;
                let yr = self.nodes[y].right;
                self.nodes[yr].parent = y;
            }
            self.transplant(z, y);
            self.nodes[y].left = self.nodes[z].left;
            let yl = self.nodes[y].left;
            self.nodes[yl].parent = y;
            self.nodes[y].is_red = self.nodes[z].is_red;
        }

        let start = self.nodes[x].parent;
        self.max_fields_fixup(start);

        if !y_orig_is_red {
            self.delete_fixup(x);
        }
    }

    fn delete_fixup(&mut self, mut x: usize) {
        while x != self.root && !self.nodes[x].is_red {
            let parent = self.nodes[x].parent;
            if x == self.nodes[parent].left {
                let mut w = self.nodes[parent].right;
                if self.nodes[w].is_red {
                    self.nodes[w].is_red = false;
                    self.nodes[parent].is_red = true;
                    self.left_rotate(parent);
                    w = self.nodes[self.nodes[x].parent].right;
                }
                if !self.nodes[self.nodes[w].left].is_red && !self.nodes[self.nodes[w].right].is_red
                {
                    self.nodes[w].is_red = true;
                    x = self.nodes[x].parent;
                } else {
                    if !self.nodes[self.nodes[w].right].is_red {
                        let wl = self.nodes[w].left;
                        self.nodes[wl].is_red = false;
                        self.nodes[w].is_red = true;
                        self.right_rotate(w);
                        w = self.nodes[self.nodes[x].parent].right;
                    }
                    let parent = self.nodes[x].parent;
                    self.nodes[w].is_red = self.nodes[parent].is_red;
                    self.nodes[parent].is_red = false;
                    let wr = self.nodes[w].right;
                    self.nodes[wr].is_red = false;
                    self.left_rotate(parent);
                    x = self.root;
                }
            } else {
                let mut w = self.nodes[parent].left;
                if self.nodes[w].is_red {
                    self.nodes[w].is_red = false;
                    self.nodes[parent].is_red = true;
                    self.right_rotate(parent);
                    w = self.nodes[self.nodes[x].parent].left;
                }
                if !self.nodes[self.nodes[w].left].is_red && !self.nodes[self.nodes[w].right].is_red
                {
                    self.nodes[w].is_red = true;
                    x = self.nodes[x].parent;
                } else {
                    if !self.nodes[self.nodes[w].left].is_red {
                        let wr = self.nodes[w].right;
                        self.nodes[wr].is_red = false;
                        self.nodes[w].is_red = true;
                        self.left_rotate(w);
                        w = self.nodes[self.nodes[x].parent].left;
                    }
                    let parent = self.nodes[x].parent;
                    self.nodes[w].is_red = self.nodes[parent].is_red;
                    self.nodes[parent].is_red = false;
                    let wl = self.nodes[w].left;
                    self.nodes[wl].is_red = false;
                    self.right_rotate(parent);
                    x = self.root;
                }
            }
        }
        self.nodes[x].is_red = false;
    }

    fn minimum(&self, mut x: usize) -> usize {
        while self.nodes[x].left != NIL {
            x = self.nodes[x].left;
        }
        x
    }

    fn left_rotate(&mut self, x: usize) {
        let y = self.nodes[x].right;
        self.nodes[x].right = self.nodes[y].left;
        if self.nodes[y].left != NIL {
            let yl = self.nodes[y].left;
            self.nodes[yl].parent = x;
        }
        self.nodes[y].parent = self.nodes[x].parent;

        let x_parent = self.nodes[x].parent;
        if x_parent == NIL {
            self.root = y;
        } else if x == self.nodes[x_parent].left {
            self.nodes[x_parent].left = y;
        } else {
            self.nodes[x_parent].right = y;
        }

        self.nodes[y].left = x;
        self.nodes[x].parent = y;

        // The node rotated up inherits the subtree aggregates; the node
        // rotated down recomputes from its new children.
        self.nodes[y].max_high = self.nodes[x].max_high.clone();
        self.nodes[y].max_timestamp = self.nodes[x].max_timestamp;
        self.set_max_fields(x);
    }

    fn right_rotate(&mut self, x: usize) {
        let y = self.nodes[x].left;
        self.nodes[x].left = self.nodes[y].right;
        if self.nodes[y].right != NIL {
            let yr = self.nodes[y].right;
            self.nodes[yr].parent = x;
        }
        self.nodes[y].parent = self.nodes[x].parent;

        let x_parent = self.nodes[x].parent;
        if x_parent == NIL {
            self.root = y;
        } else if x == self.nodes[x_parent].right {
            self.nodes[x_parent].right = y;
        } else {
            self.nodes[x_parent].left = y;
        }

        self.nodes[y].right = x;
        self.nodes[x].parent = y;

        self.nodes[y].max_high = self.nodes[x].max_high.clone();
        self.nodes[y].max_timestamp = self.nodes[x].max_timestamp;
        self.set_max_fields(x);
    }

    fn transplant(&mut self, u: usize, v: usize) {
        let u_parent = self.nodes[u].parent;
        if u_parent == NIL {
            self.root = v;
        } else if u == self.nodes[u_parent].left {
            self.nodes[u_parent].left = v;
        } else {
            self.nodes[u_parent].right = v;
        }
        self.nodes[v].parent = u_parent;
    }

    /// Recomputes aggregates walking up from `x`, stopping early once a
    /// node's aggregates come out unchanged.
    fn max_fields_fixup(&mut self, mut x: usize) {
        while x != NIL {
            let old_high = self.nodes[x].max_high.clone();
            let old_ts = self.nodes[x].max_timestamp;
            self.set_max_fields(x);
            if self.nodes[x].max_high == old_high && self.nodes[x].max_timestamp == old_ts {
                break;
            }
            x = self.nodes[x].parent;
        }
    }

    fn set_max_fields(&mut self, x: usize) {
        let left = self.nodes[x].left;
        let right = self.nodes[x].right;

        let mut max_high = self.nodes[x].interval.high.clone();
        let mut max_ts = self.nodes[x].interval.timestamp;
        for child in [left, right] {
            if child != NIL {
                if self.nodes[child].max_high > max_high {
                    max_high = self.nodes[child].max_high.clone();
                }
                max_ts = max_ts.max(self.nodes[child].max_timestamp);
            }
        }
        self.nodes[x].max_high = max_high;
        self.nodes[x].max_timestamp = max_ts;
    }

    // ---- Invariant checks (tests only) ----

    #[cfg(test)]
    pub fn check_augmentation(&self) {
        self.check_augmentation_from(self.root);
    }

    #[cfg(test)]
    fn check_augmentation_from(&self, x: usize) {
        if x == NIL {
            return;
        }
        let node = &self.nodes[x];
        let mut expect_high = node.interval.high.clone();
        let mut expect_ts = node.interval.timestamp;
        for child in [node.left, node.right] {
            if child != NIL {
                assert_eq!(self.nodes[child].parent, x, "broken parent link");
                if self.nodes[child].max_high > expect_high {
                    expect_high = self.nodes[child].max_high.clone();
                }
                expect_ts = expect_ts.max(self.nodes[child].max_timestamp);
            }
        }
        assert_eq!(node.max_high, expect_high, "max_high wrong at {:?}", node.interval.id);
        assert_eq!(
            node.max_timestamp, expect_ts,
            "max_timestamp wrong at {:?}",
            node.interval.id
        );
        self.check_augmentation_from(node.left);
        self.check_augmentation_from(node.right);
    }
}
