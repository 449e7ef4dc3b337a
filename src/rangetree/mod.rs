//! Augmented interval tree over 64-bit address ranges.
//!
//! The tree is an AVL tree stored in an arena and ordered by
//! `(start, end, insertion sequence)`. Every node caches, for its subtree, the
//! smallest and largest start and end addresses plus an aggregate of
//! user-defined [`RangeProperties`]. Overlap queries prune whole subtrees with
//! the cached bounds, and aggregate queries take a subtree's cached properties
//! as soon as every item below it is known to overlap the query.
//!
//! Ranges are inclusive on both ends.

pub mod properties;

pub use properties::{
    DiffEntry, DiffProperties, MemMapProperties, PhysicalEntry, ValidityFlags, VirtualEntry,
};

use std::cmp::Ordering;

/// An item with an inclusive address range.
pub trait RangeItem: Clone {
    fn start(&self) -> u64;
    fn end(&self) -> u64;
}

/// Aggregate over a set of items.
pub trait RangeProperties<T>: Clone + Default {
    /// Fold one item into the aggregate.
    fn update(&mut self, item: &T);

    /// Fold another aggregate into this one.
    fn unite(&mut self, other: &Self);
}

#[derive(Debug, Clone)]
struct TreeNode<T, P> {
    item: T,
    seq: u64,
    left: Option<usize>,
    right: Option<usize>,
    height: u32,
    min_start: u64,
    max_start: u64,
    min_end: u64,
    max_end: u64,
    props: P,
}

impl<T: RangeItem, P> TreeNode<T, P> {
    fn key(&self) -> (u64, u64, u64) {
        (self.item.start(), self.item.end(), self.seq)
    }
}

/// Interval tree with per-subtree aggregates.
#[derive(Debug, Clone)]
pub struct AddressRangeTree<T, P> {
    nodes: Vec<TreeNode<T, P>>,
    root: Option<usize>,
    next_seq: u64,
}

impl<T: RangeItem, P: RangeProperties<T>> Default for AddressRangeTree<T, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: RangeItem, P: RangeProperties<T>> AddressRangeTree<T, P> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root = None;
        self.next_seq = 0;
    }

    /// Insert an item.
    ///
    /// # Panics
    ///
    /// Panics if the item's start lies above its end.
    pub fn insert(&mut self, item: T) {
        assert!(
            item.start() <= item.end(),
            "malformed range {:#x}..={:#x}",
            item.start(),
            item.end()
        );
        let mut props = P::default();
        props.update(&item);
        let idx = self.nodes.len();
        self.nodes.push(TreeNode {
            seq: self.next_seq,
            left: None,
            right: None,
            height: 1,
            min_start: item.start(),
            max_start: item.start(),
            min_end: item.end(),
            max_end: item.end(),
            props,
            item,
        });
        self.next_seq += 1;
        self.root = Some(self.insert_at(self.root, idx));
    }

    fn insert_at(&mut self, at: Option<usize>, new: usize) -> usize {
        let Some(cur) = at else {
            return new;
        };
        if self.nodes[new].key().cmp(&self.nodes[cur].key()) == Ordering::Less {
            let l = self.insert_at(self.nodes[cur].left, new);
            self.nodes[cur].left = Some(l);
        } else {
            let r = self.insert_at(self.nodes[cur].right, new);
            self.nodes[cur].right = Some(r);
        }
        self.rebalance(cur)
    }

    fn height(&self, n: Option<usize>) -> u32 {
        n.map(|i| self.nodes[i].height).unwrap_or(0)
    }

    fn balance_factor(&self, n: usize) -> i64 {
        self.height(self.nodes[n].left) as i64 - self.height(self.nodes[n].right) as i64
    }

    /// Recompute the cached height, bounds and aggregate of `n` from its children.
    fn pull_up(&mut self, n: usize) {
        let (left, right) = (self.nodes[n].left, self.nodes[n].right);
        let item = &self.nodes[n].item;
        let (mut min_start, mut max_start) = (item.start(), item.start());
        let (mut min_end, mut max_end) = (item.end(), item.end());
        let mut props = P::default();
        props.update(item);

        for child in [left, right].into_iter().flatten() {
            let c = &self.nodes[child];
            min_start = min_start.min(c.min_start);
            max_start = max_start.max(c.max_start);
            min_end = min_end.min(c.min_end);
            max_end = max_end.max(c.max_end);
            props.unite(&c.props);
        }

        let height = 1 + self.height(left).max(self.height(right));
        let node = &mut self.nodes[n];
        node.min_start = min_start;
        node.max_start = max_start;
        node.min_end = min_end;
        node.max_end = max_end;
        node.props = props;
        node.height = height;
    }

    fn rotate_right(&mut self, n: usize) -> usize {
        let Some(l) = self.nodes[n].left else {
            return n;
        };
        self.nodes[n].left = self.nodes[l].right;
        self.nodes[l].right = Some(n);
        self.pull_up(n);
        self.pull_up(l);
        l
    }

    fn rotate_left(&mut self, n: usize) -> usize {
        let Some(r) = self.nodes[n].right else {
            return n;
        };
        self.nodes[n].right = self.nodes[r].left;
        self.nodes[r].left = Some(n);
        self.pull_up(n);
        self.pull_up(r);
        r
    }

    fn rebalance(&mut self, n: usize) -> usize {
        self.pull_up(n);
        let bf = self.balance_factor(n);
        if bf > 1 {
            if let Some(l) = self.nodes[n].left {
                if self.balance_factor(l) < 0 {
                    let nl = self.rotate_left(l);
                    self.nodes[n].left = Some(nl);
                }
            }
            return self.rotate_right(n);
        }
        if bf < -1 {
            if let Some(r) = self.nodes[n].right {
                if self.balance_factor(r) > 0 {
                    let nr = self.rotate_right(r);
                    self.nodes[n].right = Some(nr);
                }
            }
            return self.rotate_left(n);
        }
        n
    }

    /// All items whose range intersects `[start, end]`, in key order.
    pub fn objects_in_range(&self, start: u64, end: u64) -> Vec<T> {
        let mut out = Vec::new();
        self.visit_in_range(self.root, start, end, &mut out);
        out
    }

    fn visit_in_range(&self, at: Option<usize>, start: u64, end: u64, out: &mut Vec<T>) {
        let Some(n) = at else { return };
        let node = &self.nodes[n];
        if node.max_end < start || node.min_start > end {
            return;
        }
        self.visit_in_range(node.left, start, end, out);
        if node.item.start() <= end && node.item.end() >= start {
            out.push(node.item.clone());
        }
        self.visit_in_range(node.right, start, end, out);
    }

    /// All items covering `address`.
    pub fn objects_at(&self, address: u64) -> Vec<T> {
        self.objects_in_range(address, address)
    }

    /// Aggregate over exactly the items intersecting `[start, end]`.
    pub fn properties_of_range(&self, start: u64, end: u64) -> P {
        let mut props = P::default();
        let mut stack: Vec<usize> = self.root.into_iter().collect();
        while let Some(n) = stack.pop() {
            let node = &self.nodes[n];
            if node.max_end < start || node.min_start > end {
                continue;
            }
            // Every item below overlaps the query.
            if node.max_start <= end && node.min_end >= start {
                props.unite(&node.props);
                continue;
            }
            if node.item.start() <= end && node.item.end() >= start {
                props.update(&node.item);
            }
            stack.extend(node.left);
            stack.extend(node.right);
        }
        props
    }

    /// Aggregate over the whole tree.
    pub fn properties(&self) -> P {
        self.root
            .map(|r| self.nodes[r].props.clone())
            .unwrap_or_default()
    }

    /// Iterate over all items in key order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let mut stack = Vec::new();
        let mut cur = self.root;
        std::iter::from_fn(move || {
            while let Some(n) = cur {
                stack.push(n);
                cur = self.nodes[n].left;
            }
            let n = stack.pop()?;
            cur = self.nodes[n].right;
            Some(&self.nodes[n].item)
        })
    }

    /// Height of the tree, zero when empty.
    pub fn depth(&self) -> u32 {
        self.height(self.root)
    }
}
