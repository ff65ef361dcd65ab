use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

use crate::error::{OverlayError, OverlayResult};

/// Upper bound on key dimensionality. A tree node holds `2^dims` child slots.
pub const MAX_DIMS: usize = 8;

/// Opaque payload stored under a key.
pub type Value = Vec<u8>;

/// A point in D-dimensional space.
///
/// Rendered on the wire as comma-separated coordinates (`0.2,0.35`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key(Vec<f64>);

impl Key {
    pub fn new(coords: Vec<f64>) -> Self {
        Self(coords)
    }

    /// Key with every coordinate set to `value`.
    pub fn splat(dims: usize, value: f64) -> Self {
        Self(vec![value; dims])
    }

    pub fn dims(&self) -> usize {
        self.0.len()
    }

    pub fn coords(&self) -> &[f64] {
        &self.0
    }

    /// Quadrant code of `probe` relative to this key: bit `j` is set iff
    /// `probe[j] >= self[j]`.
    pub fn quadrant(&self, probe: &Key) -> usize {
        self.0
            .iter()
            .zip(probe.0.iter())
            .enumerate()
            .fold(0, |code, (j, (own, other))| {
                if other >= own {
                    code | (1 << j)
                } else {
                    code
                }
            })
    }

    pub fn distance(&self, other: &Key) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt()
    }

    /// Closed-box containment: `lo[j] <= self[j] <= hi[j]` on every axis.
    pub fn within(&self, lo: &Key, hi: &Key) -> bool {
        self.0
            .iter()
            .enumerate()
            .all(|(j, c)| lo.0[j] <= *c && *c <= hi.0[j])
    }

    /// Parses a key and checks its dimensionality.
    pub fn parse_dims(text: &str, dims: usize) -> OverlayResult<Self> {
        let key: Key = text.parse()?;
        if key.dims() != dims {
            return Err(OverlayError::parse(format!(
                "key ({}) has {} coordinates, expected {}",
                text,
                key.dims(),
                dims
            )));
        }
        Ok(key)
    }
}

impl Index<usize> for Key {
    type Output = f64;

    fn index(&self, dim: usize) -> &f64 {
        &self.0[dim]
    }
}

impl IndexMut<usize> for Key {
    fn index_mut(&mut self, dim: usize) -> &mut f64 {
        &mut self.0[dim]
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (j, c) in self.0.iter().enumerate() {
            if j > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl FromStr for Key {
    type Err = OverlayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let coords = s
            .split(',')
            .map(|c| {
                c.trim()
                    .parse::<f64>()
                    .map_err(|e| OverlayError::parse(format!("bad coordinate {:?}: {}", c, e)))
            })
            .collect::<OverlayResult<Vec<f64>>>()?;
        if coords.is_empty() || coords.len() > MAX_DIMS {
            return Err(OverlayError::parse(format!(
                "key ({}) must have 1..={} coordinates",
                s, MAX_DIMS
            )));
        }
        Ok(Self(coords))
    }
}

/// A stored key/value pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: Key,
    pub value: Value,
}

impl Entry {
    pub fn new(key: Key, value: impl Into<Value>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    pub fn value_text(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// One result of a nearest-neighbour search.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub distance: f64,
    pub entry: Entry,
}

/// Heap element ordered by distance, so `BinaryHeap` pops the farthest first.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub distance: f64,
    pub slot: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.slot.cmp(&other.slot))
    }
}
