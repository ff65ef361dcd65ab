//! Per-node overlay state.
//!
//! A node owns one [`Region`] and remembers every split that carved it out
//! of the root region: which half it kept, the boundary, and the node last
//! known to own the other half. Level `j` of the history splits dimension
//! `j % D`.
//!
//! Everything here is synchronous; the service layer decides what to do
//! with the links and plans computed from this state.

use crate::error::{OverlayError, OverlayResult};
use crate::overlay::types::{Address, Half, NodeId, PeerLink, SplitRecord};
use crate::protocol::description::NodeDescription;
use crate::storage::region::Region;
use crate::storage::types::Key;

/// A sub-box of a range query that belongs behind split `level`.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeFragment {
    pub level: usize,
    pub lo: Key,
    pub hi: Key,
}

#[derive(Debug)]
pub struct NodeState {
    address: Address,
    region: Region,
    splits: Vec<SplitRecord>,
    /// Regions left behind by departed nodes that found no merge partner.
    orphans: Vec<NodeState>,
}

impl NodeState {
    /// The node owning the whole key space.
    pub fn root(address: Address, lo: Key, hi: Key) -> OverlayResult<Self> {
        Ok(Self {
            address,
            region: Region::new(lo, hi)?,
            splits: Vec::new(),
            orphans: Vec::new(),
        })
    }

    /// Rebuilds a node from its description. Links start out unset.
    pub fn from_description(desc: NodeDescription) -> OverlayResult<Self> {
        let halves = desc.id.halves();
        if desc.boundaries.len() != halves.len() || desc.siblings.len() != halves.len() {
            return Err(OverlayError::parse(format!(
                "description of {} has {} boundaries and {} siblings",
                desc.id,
                desc.boundaries.len(),
                desc.siblings.len()
            )));
        }
        let mut region = Region::new(desc.lo, desc.hi)?;
        if let Some(entries) = desc.entries {
            region.load(entries)?;
        }
        let splits = halves
            .into_iter()
            .zip(desc.boundaries)
            .zip(desc.siblings)
            .map(|((side, boundary), sibling)| SplitRecord::new(side, boundary, sibling))
            .collect();
        Ok(Self {
            address: desc.address,
            region,
            splits,
            orphans: Vec::new(),
        })
    }

    pub fn describe(&self, with_data: bool) -> NodeDescription {
        NodeDescription {
            lo: self.region.lo().clone(),
            hi: self.region.hi().clone(),
            address: self.address.clone(),
            id: self.id(),
            boundaries: self.splits.iter().map(|s| s.boundary).collect(),
            siblings: self.splits.iter().map(|s| s.sibling.clone()).collect(),
            entries: with_data.then(|| self.region.entries()),
        }
    }

    pub fn id(&self) -> NodeId {
        NodeId::from_halves(self.splits.iter().map(|s| &s.side))
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn set_address(&mut self, address: Address) {
        self.address = address;
    }

    pub fn dims(&self) -> usize {
        self.region.dims()
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut Region {
        &mut self.region
    }

    pub fn splits(&self) -> &[SplitRecord] {
        &self.splits
    }

    pub fn depth(&self) -> usize {
        self.splits.len()
    }

    pub fn split_dimension(&self, level: usize) -> usize {
        level % self.dims()
    }

    pub fn is_relevant(&self, key: &Key) -> bool {
        self.region.is_relevant(key)
    }

    /// Shallowest split whose far side contains `key`.
    pub fn forward_to(&self, key: &Key) -> Option<usize> {
        self.splits.iter().enumerate().find_map(|(level, split)| {
            let coord = key[self.split_dimension(level)];
            split.side.excludes(coord, split.boundary).then_some(level)
        })
    }

    /// Id of the subtree on the far side of split `level`.
    pub fn level_id(&self, level: usize) -> NodeId {
        let mut halves: Vec<Half> = self.splits[..level].iter().map(|s| s.side).collect();
        halves.push(self.splits[level].side.opposite());
        NodeId::from_halves(&halves)
    }

    pub fn link(&self, level: usize) -> Option<PeerLink> {
        self.splits.get(level).and_then(|s| s.link.clone())
    }

    pub fn set_link(&mut self, level: usize, link: Option<PeerLink>) {
        if let Some(split) = self.splits.get_mut(level) {
            split.link = link;
        }
    }

    /// Points split `level` at a new sibling; the old link is dropped.
    pub fn replace_sibling(&mut self, level: usize, sibling: Address, link: Option<PeerLink>) {
        if let Some(split) = self.splits.get_mut(level) {
            split.sibling = sibling;
            split.link = link;
        }
    }

    /// Levels whose sibling has no open connection.
    pub fn unlinked_levels(&self) -> Vec<(usize, Address)> {
        self.splits
            .iter()
            .enumerate()
            .filter(|(_, s)| s.link.is_none())
            .map(|(level, s)| (level, s.sibling.clone()))
            .collect()
    }

    pub fn live_links(&self) -> Vec<(usize, PeerLink)> {
        self.splits
            .iter()
            .enumerate()
            .filter_map(|(level, s)| s.link.clone().map(|l| (level, l)))
            .collect()
    }

    pub fn take_links(&mut self) -> Vec<PeerLink> {
        self.splits.iter_mut().filter_map(|s| s.link.take()).collect()
    }

    /// Halves the region along the next split dimension at its median.
    ///
    /// This node keeps the lower half and links to `joiner`; the returned
    /// node owns the upper half, inherits this node's history and points
    /// back here at its newest level.
    pub fn split(&mut self, joiner: Address) -> NodeState {
        let level = self.splits.len();
        let dim = self.split_dimension(level);
        let boundary = self.region.median(dim);
        let upper = self.region.partition(dim, boundary);

        let mut sibling_splits: Vec<SplitRecord> =
            self.splits.iter().map(SplitRecord::detached).collect();
        sibling_splits.push(SplitRecord::new(
            Half::Upper,
            boundary,
            self.address.clone(),
        ));
        self.splits
            .push(SplitRecord::new(Half::Lower, boundary, joiner.clone()));

        NodeState {
            address: joiner,
            region: upper,
            splits: sibling_splits,
            orphans: Vec::new(),
        }
    }

    fn check_mergeable(&self, other: &NodeState, upper: bool) -> OverlayResult<usize> {
        if self.splits.is_empty() {
            return Err(OverlayError::merge("root region has no sibling"));
        }
        if self.splits.len() != other.splits.len() {
            return Err(OverlayError::merge(format!(
                "split depths differ ({} vs {})",
                self.splits.len(),
                other.splits.len()
            )));
        }
        let dim = self.split_dimension(self.splits.len() - 1);
        for j in 0..self.dims() {
            let fits = if j == dim {
                if upper {
                    other.region.lo()[j] == self.region.hi()[j]
                } else {
                    self.region.lo()[j] == other.region.hi()[j]
                }
            } else {
                other.region.lo()[j] == self.region.lo()[j]
                    && other.region.hi()[j] == self.region.hi()[j]
            };
            if !fits {
                return Err(OverlayError::merge(format!(
                    "[({}), ({})) does not abut [({}), ({})) on dimension {}",
                    other.region.lo(),
                    other.region.hi(),
                    self.region.lo(),
                    self.region.hi(),
                    j
                )));
            }
        }
        Ok(dim)
    }

    /// Absorbs the node that owns the upper half of the newest split.
    pub fn merge_hi(&mut self, other: NodeState) -> OverlayResult<()> {
        self.check_mergeable(&other, true)?;
        self.absorb(other);
        Ok(())
    }

    /// Absorbs the node that owns the lower half of the newest split.
    pub fn merge_lo(&mut self, other: NodeState) -> OverlayResult<()> {
        self.check_mergeable(&other, false)?;
        self.absorb(other);
        Ok(())
    }

    /// Merges with the sibling of the newest split, whichever half it owns.
    pub fn merge(&mut self, other: NodeState) -> OverlayResult<()> {
        match self.splits.last().map(|s| s.side) {
            Some(Half::Lower) => self.merge_hi(other),
            Some(Half::Upper) => self.merge_lo(other),
            None => Err(OverlayError::merge("root region has no sibling")),
        }
    }

    fn absorb(&mut self, other: NodeState) {
        self.region.absorb(other.region);
        self.orphans.extend(other.orphans);
        // Dropping the record closes the link to the absorbed node.
        self.splits.pop();
    }

    /// Sub-boxes of the closed box `[lo, hi]` lying outside this region,
    /// one per split whose far side the box reaches.
    pub fn range_fragments(&self, lo: &Key, hi: &Key) -> Vec<RangeFragment> {
        if self.region.encloses(lo, hi) {
            return Vec::new();
        }
        let mut lo = lo.clone();
        let mut hi = hi.clone();
        let mut fragments = Vec::new();
        for (level, split) in self.splits.iter().enumerate() {
            let d = self.split_dimension(level);
            let b = split.boundary;
            match split.side {
                Half::Lower => {
                    if hi[d] < b {
                        continue;
                    }
                    let mut far_lo = lo.clone();
                    far_lo[d] = lo[d].max(b);
                    fragments.push(RangeFragment {
                        level,
                        lo: far_lo,
                        hi: hi.clone(),
                    });
                    if lo[d] >= b {
                        break;
                    }
                    hi[d] = below(b);
                }
                Half::Upper => {
                    if lo[d] >= b {
                        continue;
                    }
                    let mut far_hi = hi.clone();
                    far_hi[d] = hi[d].min(below(b));
                    fragments.push(RangeFragment {
                        level,
                        lo: lo.clone(),
                        hi: far_hi,
                    });
                    if hi[d] < b {
                        break;
                    }
                    lo[d] = b;
                }
            }
        }
        fragments
    }

    /// Split levels from `depth` on whose far side intersects the ball of
    /// `radius` around `center`, approximated by its bounding box.
    pub fn nearest_levels(&self, center: &Key, radius: f64, depth: usize) -> Vec<usize> {
        let dims = self.dims();
        let lo = Key::new((0..dims).map(|j| center[j] - radius).collect());
        let hi = Key::new((0..dims).map(|j| center[j] + radius).collect());
        if self.region.encloses(&lo, &hi) {
            return Vec::new();
        }
        self.splits
            .iter()
            .enumerate()
            .skip(depth)
            .filter(|(level, split)| {
                let d = self.split_dimension(*level);
                match split.side {
                    Half::Lower => hi[d] >= split.boundary,
                    Half::Upper => lo[d] < split.boundary,
                }
            })
            .map(|(level, _)| level)
            .collect()
    }

    pub fn orphans(&self) -> &[NodeState] {
        &self.orphans
    }

    pub fn push_orphan(&mut self, orphan: NodeState) {
        self.orphans.push(orphan);
    }

    pub fn pop_orphan(&mut self) -> Option<NodeState> {
        self.orphans.pop()
    }

    pub fn take_orphans(&mut self) -> Vec<NodeState> {
        std::mem::take(&mut self.orphans)
    }

    /// The cached orphan responsible for `key`, if any.
    pub fn orphan_for(&mut self, key: &Key) -> Option<&mut NodeState> {
        self.orphans.iter_mut().find(|o| o.is_relevant(key))
    }

    /// Number of entries stored locally, orphans excluded.
    pub fn data_load(&self) -> usize {
        self.region.len()
    }

    pub fn volume_load(&self) -> f64 {
        self.region.volume()
    }
}

/// Largest `f64` strictly less than `x`.
fn below(x: f64) -> f64 {
    if x.is_nan() || x == f64::NEG_INFINITY {
        x
    } else if x == 0.0 {
        -f64::from_bits(1)
    } else if x > 0.0 {
        f64::from_bits(x.to_bits() - 1)
    } else {
        f64::from_bits(x.to_bits() + 1)
    }
}
