use rand::seq::SliceRandom;

use super::tree::SpatialTree;
use super::types::{Entry, Key, Neighbor, Value, MAX_DIMS};
use crate::error::{OverlayError, OverlayResult};

/// An axis-aligned box `[lo, hi)` and the tree holding the entries inside it.
#[derive(Debug)]
pub struct Region {
    lo: Key,
    hi: Key,
    tree: SpatialTree,
}

impl Region {
    pub fn new(lo: Key, hi: Key) -> OverlayResult<Self> {
        let dims = lo.dims();
        if dims == 0 || dims > MAX_DIMS {
            return Err(OverlayError::region(format!(
                "dimensionality {} outside 1..={}",
                dims, MAX_DIMS
            )));
        }
        if hi.dims() != dims {
            return Err(OverlayError::region(format!(
                "corners ({}) and ({}) disagree on dimensionality",
                lo, hi
            )));
        }
        if (0..dims).any(|j| lo[j] > hi[j]) {
            return Err(OverlayError::region(format!(
                "lower corner ({}) exceeds upper corner ({})",
                lo, hi
            )));
        }
        Ok(Self {
            lo,
            hi,
            tree: SpatialTree::new(dims),
        })
    }

    pub fn dims(&self) -> usize {
        self.lo.dims()
    }

    pub fn lo(&self) -> &Key {
        &self.lo
    }

    pub fn hi(&self) -> &Key {
        &self.hi
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn tree(&self) -> &SpatialTree {
        &self.tree
    }

    /// Half-open ownership test: `lo[j] <= key[j] < hi[j]` on every axis.
    pub fn is_relevant(&self, key: &Key) -> bool {
        key.dims() == self.dims()
            && (0..self.dims()).all(|j| self.lo[j] <= key[j] && key[j] < self.hi[j])
    }

    /// Whether the closed box `[lo, hi]` lies entirely inside this region.
    pub fn encloses(&self, lo: &Key, hi: &Key) -> bool {
        (0..self.dims()).all(|j| self.lo[j] <= lo[j] && hi[j] < self.hi[j])
    }

    /// Whether the closed box `[lo, hi]` overlaps this region.
    pub fn intersects(&self, lo: &Key, hi: &Key) -> bool {
        (0..self.dims()).all(|j| lo[j] < self.hi[j] && hi[j] >= self.lo[j])
    }

    fn ensure_relevant(&self, key: &Key) -> OverlayResult<()> {
        if self.is_relevant(key) {
            Ok(())
        } else {
            Err(OverlayError::routing(format!(
                "key ({}) lies outside region [({}), ({}))",
                key, self.lo, self.hi
            )))
        }
    }

    /// Stores `value` under `key`, replacing any existing value.
    pub fn update(&mut self, key: Key, value: Value) -> OverlayResult<()> {
        self.ensure_relevant(&key)?;
        match self.tree.search_mut(&key) {
            Some(slot) => *slot = value,
            None => self.tree.push(key, value),
        }
        Ok(())
    }

    /// Appends `value` to the existing value under `key`, or inserts it.
    pub fn concatenate(&mut self, key: Key, value: Value) -> OverlayResult<()> {
        self.ensure_relevant(&key)?;
        match self.tree.search_mut(&key) {
            Some(slot) => slot.extend_from_slice(&value),
            None => self.tree.push(key, value),
        }
        Ok(())
    }

    pub fn lookup(&self, key: &Key) -> Option<&Value> {
        self.tree.search(key)
    }

    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        self.tree.pop(key)
    }

    pub fn range(&self, lo: &Key, hi: &Key) -> Vec<Entry> {
        self.tree.range(lo, hi)
    }

    /// Nearest-neighbour search. A negative radius is returned untouched
    /// with no results.
    pub fn nearest(&self, center: &Key, k: usize, radius: f64) -> (Vec<Neighbor>, f64) {
        if radius < 0.0 {
            return (Vec::new(), radius);
        }
        self.tree.nearest(center, k, radius)
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.tree.entries()
    }

    /// Split point along `dim`: the middle of the region when empty,
    /// otherwise the `dim` coordinate of the entry at index `len / 2`
    /// of the descending order.
    pub fn median(&self, dim: usize) -> f64 {
        let ordered = self.tree.order(dim);
        match ordered.get(ordered.len() / 2) {
            Some(entry) => entry.key[dim],
            None => (self.lo[dim] + self.hi[dim]) / 2.0,
        }
    }

    /// Cuts the region at `boundary` along `dim`. `self` keeps the lower
    /// half `[lo, boundary)`; the upper half `[boundary, hi)` is returned.
    pub fn partition(&mut self, dim: usize, boundary: f64) -> Region {
        let mut upper_lo = self.lo.clone();
        upper_lo[dim] = boundary;
        let mut upper = Region {
            lo: upper_lo,
            hi: self.hi.clone(),
            tree: SpatialTree::new(self.dims()),
        };
        self.hi[dim] = boundary;

        let mut entries = self.tree.drain();
        entries.shuffle(&mut rand::thread_rng());
        for entry in entries {
            if entry.key[dim] < boundary {
                self.tree.push(entry.key, entry.value);
            } else {
                upper.tree.push(entry.key, entry.value);
            }
        }
        upper
    }

    /// Grows this region to cover `other` and takes over its entries.
    /// Callers check that the two regions abut.
    pub fn absorb(&mut self, mut other: Region) {
        for j in 0..self.dims() {
            self.lo[j] = self.lo[j].min(other.lo[j]);
            self.hi[j] = self.hi[j].max(other.hi[j]);
        }
        let mut entries = other.tree.drain();
        entries.shuffle(&mut rand::thread_rng());
        for entry in entries {
            self.tree.push(entry.key, entry.value);
        }
    }

    /// Inserts entries carried by a node description without the
    /// replace-or-insert lookup.
    pub fn load(&mut self, entries: Vec<Entry>) -> OverlayResult<()> {
        for entry in entries {
            self.ensure_relevant(&entry.key)?;
            self.tree.push(entry.key, entry.value);
        }
        Ok(())
    }

    pub fn volume(&self) -> f64 {
        (0..self.dims()).map(|j| self.hi[j] - self.lo[j]).product()
    }
}
