//! Lazy top-K iteration over the interval tree.
//!
//! The iterator runs a best-first walk ordered by the largest
//! `max_timestamp` still reachable in each candidate subtree, so intervals
//! come out in strictly descending timestamp order without materializing
//! the full intersection set. The evaluator stops pulling as soon as its
//! heap is full and the next candidate cannot beat the heap minimum.
//!
//! The tree carries at most one live iterator. Any tree mutation clears the
//! iterator's state; the next `next()` call then fails with
//! `QueryInterrupted` and the caller retries the query.

use std::collections::{BinaryHeap, HashSet};

use crate::error::Result;
use crate::Error;

use super::tree::{Interval, Tree, NIL};
use super::IntervalTree;

/// Heap entry: a node index prioritized by the best timestamp its subtree
/// might still produce.
#[derive(Debug, PartialEq, Eq)]
struct Candidate {
    priority: u64,
    node: usize,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.node.cmp(&other.node))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Iterator state owned by the tree, cleared by any mutator.
pub(super) struct IterState {
    pub token: u64,
    low: String,
    high: String,
    heap: BinaryHeap<Candidate>,
    explored: HashSet<usize>,
}

impl IterState {
    pub(super) fn start(tree: &Tree, token: u64, low: String, high: String) -> Self {
        let mut heap = BinaryHeap::new();
        if tree.root != NIL {
            heap.push(Candidate {
                priority: tree.node(tree.root).max_timestamp,
                node: tree.root,
            });
        }
        Self {
            token,
            low,
            high,
            heap,
            explored: HashSet::new(),
        }
    }

    fn step(&mut self, tree: &Tree) -> Option<Interval> {
        while let Some(Candidate { priority, node: x }) = self.heap.pop() {
            let node = tree.node(x);

            if !self.explored.contains(&x) {
                // Branch into children, bounding away subtrees that cannot
                // reach the query's low endpoint.
                for child in [node.left, node.right] {
                    if child != NIL && tree.node(child).max_high.as_str() >= self.low.as_str() {
                        self.heap.push(Candidate {
                            priority: tree.node(child).max_timestamp,
                            node: child,
                        });
                    }
                }
            }

            if node.interval.overlaps(&self.low, &self.high) {
                let t = node.interval.timestamp;
                if t < priority {
                    // Popped on its subtree aggregate; requeue at its own
                    // timestamp to keep the output order exact.
                    self.heap.push(Candidate {
                        priority: t,
                        node: x,
                    });
                    self.explored.insert(x);
                } else {
                    return Some(node.interval.clone());
                }
            }
        }
        None
    }
}

/// Handle to the tree's single live top-K iterator.
pub struct TopKIterator<'a> {
    tree: &'a IntervalTree,
    token: u64,
}

impl<'a> TopKIterator<'a> {
    pub(super) fn new(tree: &'a IntervalTree, token: u64) -> Self {
        Self { tree, token }
    }

    /// Yields the next intersecting interval in descending timestamp order,
    /// `Ok(None)` once exhausted, or `QueryInterrupted` if the tree was
    /// mutated since the last call.
    pub fn next(&mut self) -> Result<Option<Interval>> {
        let mut inner = self.tree.inner.lock()?;
        let inner = &mut *inner;
        match inner.iter.as_mut() {
            Some(state) if state.token == self.token => Ok(state.step(&inner.tree)),
            _ => Err(Error::QueryInterrupted),
        }
    }
}

impl Drop for TopKIterator<'_> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.tree.inner.lock() {
            if inner.iter.as_ref().is_some_and(|s| s.token == self.token) {
                inner.iter = None;
            }
        }
    }
}
