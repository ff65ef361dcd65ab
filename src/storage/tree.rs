//! Multidimensional search tree.
//!
//! A generalized quadtree: every node stores one entry and `2^D` child slots.
//! The child slot of a descendant is the quadrant code of its key relative to
//! the node, so every subtree hanging from slot `j` of a node only holds keys
//! whose code relative to that node is `j`.
//!
//! Nodes live in an arena (`Vec`) addressed by index with a free list, and
//! every traversal is iterative so degenerate insertion orders cannot blow
//! the stack.

use std::collections::BinaryHeap;

use super::types::{Candidate, Entry, Key, Neighbor, Value, MAX_DIMS};

#[derive(Debug)]
struct TreeNode {
    key: Key,
    value: Value,
    parent: Option<usize>,
    children: Box<[Option<usize>]>,
}

impl TreeNode {
    fn is_leaf(&self) -> bool {
        self.children.iter().all(Option::is_none)
    }
}

#[derive(Debug)]
pub struct SpatialTree {
    dims: usize,
    slots: Vec<Option<TreeNode>>,
    free: Vec<usize>,
    root: Option<usize>,
    len: usize,
}

impl SpatialTree {
    /// Creates an empty tree over `dims` dimensions.
    ///
    /// # Panics
    /// If `dims` is zero or larger than [`MAX_DIMS`].
    pub fn new(dims: usize) -> Self {
        assert!(
            (1..=MAX_DIMS).contains(&dims),
            "tree dimensionality must be in 1..={}",
            MAX_DIMS
        );
        Self {
            dims,
            slots: Vec::new(),
            free: Vec::new(),
            root: None,
            len: 0,
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn fanout(&self) -> usize {
        1 << self.dims
    }

    fn node(&self, slot: usize) -> &TreeNode {
        match &self.slots[slot] {
            Some(node) => node,
            None => unreachable!("dangling tree slot {}", slot),
        }
    }

    fn node_mut(&mut self, slot: usize) -> &mut TreeNode {
        match &mut self.slots[slot] {
            Some(node) => node,
            None => unreachable!("dangling tree slot {}", slot),
        }
    }

    fn allocate(&mut self, key: Key, value: Value, parent: Option<usize>) -> usize {
        let node = TreeNode {
            key,
            value,
            parent,
            children: vec![None; self.fanout()].into_boxed_slice(),
        };
        self.len += 1;
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) -> TreeNode {
        let node = match self.slots[slot].take() {
            Some(node) => node,
            None => unreachable!("double release of tree slot {}", slot),
        };
        self.free.push(slot);
        self.len -= 1;
        node
    }

    /// Clears the parent's pointer to `slot`, or the root if it has none.
    fn detach(&mut self, slot: usize) {
        match self.node(slot).parent {
            Some(parent) => {
                let code = self.node(parent).key.quadrant(&self.node(slot).key);
                self.node_mut(parent).children[code] = None;
            }
            None => self.root = None,
        }
    }

    /// Inserts an entry. Duplicate keys are not rejected here.
    pub fn push(&mut self, key: Key, value: Value) {
        debug_assert_eq!(key.dims(), self.dims);
        let mut current = match self.root {
            Some(root) => root,
            None => {
                self.root = Some(self.allocate(key, value, None));
                return;
            }
        };
        loop {
            let code = self.node(current).key.quadrant(&key);
            match self.node(current).children[code] {
                Some(child) => current = child,
                None => {
                    let slot = self.allocate(key, value, Some(current));
                    self.node_mut(current).children[code] = Some(slot);
                    return;
                }
            }
        }
    }

    fn find(&self, key: &Key) -> Option<usize> {
        let mut current = self.root?;
        loop {
            let node = self.node(current);
            if node.key == *key {
                return Some(current);
            }
            current = node.children[node.key.quadrant(key)]?;
        }
    }

    pub fn search(&self, key: &Key) -> Option<&Value> {
        self.find(key).map(|slot| &self.node(slot).value)
    }

    pub fn search_mut(&mut self, key: &Key) -> Option<&mut Value> {
        let slot = self.find(key)?;
        Some(&mut self.node_mut(slot).value)
    }

    fn min_leaf(&self, mut slot: usize) -> usize {
        while let Some(child) = self.node(slot).children.iter().flatten().next() {
            slot = *child;
        }
        slot
    }

    fn max_leaf(&self, mut slot: usize) -> usize {
        while let Some(child) = self.node(slot).children.iter().rev().flatten().next() {
            slot = *child;
        }
        slot
    }

    fn subtree(&self, top: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![top];
        while let Some(slot) = stack.pop() {
            out.push(slot);
            stack.extend(self.node(slot).children.iter().flatten().copied());
        }
        out
    }

    /// Whether `candidate`'s key can replace the key at `slot` without
    /// violating the quadrant invariant for any other descendant of `slot`.
    fn accepts(&self, slot: usize, candidate: usize) -> bool {
        let pivot = &self.node(candidate).key;
        self.node(slot)
            .children
            .iter()
            .enumerate()
            .filter_map(|(code, child)| child.map(|c| (code, c)))
            .all(|(code, child)| {
                self.subtree(child)
                    .into_iter()
                    .filter(|s| *s != candidate)
                    .all(|s| pivot.quadrant(&self.node(s).key) == code)
            })
    }

    /// Removes the entry stored under `key` and returns its value.
    ///
    /// The node is refilled with a leaf substitute when one is compatible
    /// with the whole subtree; otherwise the subtree is unlinked and its
    /// remaining entries are re-inserted.
    pub fn pop(&mut self, key: &Key) -> Option<Value> {
        let slot = self.find(key)?;
        let fanout = self.fanout();

        let mut substitute = None;
        if let Some(upper) = self.node(slot).children[fanout - 1] {
            let candidate = self.min_leaf(upper);
            if self.accepts(slot, candidate) {
                substitute = Some(candidate);
            }
        }
        if substitute.is_none() {
            for code in (0..fanout - 1).rev() {
                if let Some(child) = self.node(slot).children[code] {
                    let candidate = self.max_leaf(child);
                    if self.accepts(slot, candidate) {
                        substitute = Some(candidate);
                        break;
                    }
                }
            }
        }

        if let Some(candidate) = substitute {
            self.detach(candidate);
            let moved = self.release(candidate);
            let node = self.node_mut(slot);
            node.key = moved.key;
            return Some(std::mem::replace(&mut node.value, moved.value));
        }

        if self.node(slot).is_leaf() {
            self.detach(slot);
            return Some(self.release(slot).value);
        }

        // No compatible substitute: rebuild the subtree from scratch.
        let members = self.subtree(slot);
        self.detach(slot);
        let mut popped = None;
        let mut orphaned = Vec::with_capacity(members.len());
        for member in members {
            let node = self.release(member);
            if member == slot {
                popped = Some(node.value);
            } else {
                orphaned.push((node.key, node.value));
            }
        }
        for (k, v) in orphaned {
            self.push(k, v);
        }
        popped
    }

    /// All entries inside the closed box `[lo, hi]`.
    pub fn range(&self, lo: &Key, hi: &Key) -> Vec<Entry> {
        let mut out = Vec::new();
        let mut stack: Vec<usize> = self.root.into_iter().collect();
        while let Some(slot) = stack.pop() {
            let node = self.node(slot);
            if node.key.within(lo, hi) {
                out.push(Entry::new(node.key.clone(), node.value.clone()));
            }
            let lo_code = node.key.quadrant(lo);
            let hi_code = node.key.quadrant(hi);
            for code in lo_code..=hi_code {
                // Only quadrants lying between the two corner codes.
                if code & lo_code != lo_code || code & !hi_code != 0 {
                    continue;
                }
                if let Some(child) = node.children[code] {
                    stack.push(child);
                }
            }
        }
        out
    }

    /// Up to `k` entries within `radius` of `center`, closest first, plus
    /// the distance of the farthest one returned (or `radius` when none).
    pub fn nearest(&self, center: &Key, k: usize, radius: f64) -> (Vec<Neighbor>, f64) {
        let fanout = self.fanout();
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::new();
        let mut stack: Vec<usize> = self.root.into_iter().collect();

        while let Some(slot) = stack.pop() {
            let node = self.node(slot);
            let distance = node.key.distance(center);
            let mut qualified = false;
            if distance <= radius {
                if heap.len() < k {
                    heap.push(Candidate { distance, slot });
                    qualified = true;
                } else if heap.peek().is_some_and(|top| distance < top.distance) {
                    heap.pop();
                    heap.push(Candidate { distance, slot });
                    qualified = true;
                }
            }

            // The quadrant facing away from the center can only hold
            // points farther away than this node.
            let opposite = (fanout - 1) ^ node.key.quadrant(center);
            for code in (0..fanout).rev() {
                if !qualified && code == opposite {
                    continue;
                }
                if let Some(child) = node.children[code] {
                    stack.push(child);
                }
            }
        }

        let found: Vec<Neighbor> = heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| {
                let node = self.node(c.slot);
                Neighbor {
                    distance: c.distance,
                    entry: Entry::new(node.key.clone(), node.value.clone()),
                }
            })
            .collect();
        let reach = found.last().map_or(radius, |n| n.distance);
        (found, reach)
    }

    /// Every entry, in no particular order.
    pub fn entries(&self) -> Vec<Entry> {
        self.slots
            .iter()
            .flatten()
            .map(|node| Entry::new(node.key.clone(), node.value.clone()))
            .collect()
    }

    /// Every entry sorted by coordinate `dim`, descending.
    pub fn order(&self, dim: usize) -> Vec<Entry> {
        let mut entries = self.entries();
        entries.sort_by(|a, b| b.key[dim].total_cmp(&a.key[dim]));
        entries
    }

    /// Empties the tree and hands back its entries.
    pub fn drain(&mut self) -> Vec<Entry> {
        let entries = self
            .slots
            .drain(..)
            .flatten()
            .map(|node| Entry::new(node.key, node.value))
            .collect();
        self.free.clear();
        self.root = None;
        self.len = 0;
        entries
    }

    /// Checks the quadrant invariant and the node count over the whole tree.
    pub fn is_consistent(&self) -> bool {
        let reachable = match self.root {
            Some(root) => self.subtree(root),
            None => Vec::new(),
        };
        if reachable.len() != self.len {
            return false;
        }
        reachable.into_iter().all(|slot| {
            let node = self.node(slot);
            node.children
                .iter()
                .enumerate()
                .filter_map(|(code, child)| child.map(|c| (code, c)))
                .all(|(code, child)| {
                    self.node(child).parent == Some(slot)
                        && self
                            .subtree(child)
                            .into_iter()
                            .all(|s| node.key.quadrant(&self.node(s).key) == code)
                })
        })
    }
}
