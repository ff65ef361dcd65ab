//! Textual node descriptions.
//!
//! A description carries everything needed to rebuild a node elsewhere:
//!
//! ```text
//! #AREA
//! <lo coordinates, one per line>
//! <hi coordinates, one per line>
//! #NODE
//! <host> <port>
//! <split history, e.g. 0110>
//! <split boundaries, one per line>
//! <sibling host> <sibling port>     (one line per split)
//! #TUPLES <n>                       (only with data)
//! <k1,...,kD> <value>
//! #END
//! ```

use std::fmt;

use super::message::END_MARKER;
use crate::error::{OverlayError, OverlayResult};
use crate::overlay::types::{Address, NodeId};
use crate::storage::types::{Entry, Key};

const AREA_MARKER: &str = "#AREA";
const NODE_MARKER: &str = "#NODE";
const TUPLES_MARKER: &str = "#TUPLES";

#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescription {
    pub lo: Key,
    pub hi: Key,
    pub address: Address,
    pub id: NodeId,
    pub boundaries: Vec<f64>,
    pub siblings: Vec<Address>,
    /// Present only when the description was produced with data.
    pub entries: Option<Vec<Entry>>,
}

impl NodeDescription {
    pub fn parse(text: &str, dims: usize) -> OverlayResult<Self> {
        let mut lines = Lines::new(text);

        lines.expect_marker(AREA_MARKER)?;
        let mut lo = Vec::with_capacity(dims);
        for _ in 0..dims {
            lo.push(lines.number("lower corner")?);
        }
        let mut hi = Vec::with_capacity(dims);
        for _ in 0..dims {
            hi.push(lines.number("upper corner")?);
        }

        lines.expect_marker(NODE_MARKER)?;
        let address = {
            let line = lines.next("node address")?;
            let mut words = line.split_whitespace();
            match (words.next(), words.next()) {
                (Some(host), Some(port)) => Address::from_wire(host, port)?,
                _ => return Err(OverlayError::parse(format!("bad node address {:?}", line))),
            }
        };
        let id = NodeId::parse(lines.next("split history")?)?;

        let levels = id.len();
        let mut boundaries = Vec::with_capacity(levels);
        if levels == 0 {
            // An empty boundary list is written as a blank line.
            if lines.peek().is_some_and(|l| l.trim().is_empty()) {
                lines.next("boundaries")?;
            }
        }
        for _ in 0..levels {
            boundaries.push(lines.number("split boundary")?);
        }

        let mut siblings = Vec::with_capacity(levels);
        for _ in 0..levels {
            let line = lines.next("sibling address")?;
            let mut words = line.split_whitespace();
            match (words.next(), words.next()) {
                (Some(host), Some(port)) => siblings.push(Address::from_wire(host, port)?),
                _ => {
                    return Err(OverlayError::parse(format!(
                        "bad sibling address {:?}",
                        line
                    )))
                }
            }
        }

        let mut entries = None;
        let line = lines.next("tuples or end marker")?;
        let line = if let Some(count) = line.strip_prefix(TUPLES_MARKER) {
            let count: usize = count
                .trim()
                .parse()
                .map_err(|e| OverlayError::parse(format!("bad tuple count {:?}: {}", count, e)))?;
            let mut tuples = Vec::new();
            for found in 0..count {
                let line = lines.next("tuple")?;
                if line.trim() == END_MARKER {
                    return Err(OverlayError::parse(format!(
                        "description promised {} tuples but holds {}",
                        count, found
                    )));
                }
                let (key, value) = line.split_once(' ').unwrap_or((line, ""));
                tuples.push(Entry::new(Key::parse_dims(key, dims)?, value.as_bytes()));
            }
            entries = Some(tuples);
            lines.next("end marker")?
        } else {
            line
        };
        if line.trim() != END_MARKER {
            return Err(OverlayError::parse(format!(
                "expected {} but found {:?}",
                END_MARKER, line
            )));
        }

        Ok(Self {
            lo: Key::new(lo),
            hi: Key::new(hi),
            address,
            id,
            boundaries,
            siblings,
            entries,
        })
    }
}

impl fmt::Display for NodeDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", AREA_MARKER)?;
        for c in self.lo.coords().iter().chain(self.hi.coords()) {
            writeln!(f, "{}", c)?;
        }
        writeln!(f, "{}", NODE_MARKER)?;
        writeln!(f, "{}", self.address.wire())?;
        writeln!(f, "{}", self.id)?;
        if self.boundaries.is_empty() {
            writeln!(f)?;
        }
        for b in &self.boundaries {
            writeln!(f, "{}", b)?;
        }
        for sibling in &self.siblings {
            writeln!(f, "{}", sibling.wire())?;
        }
        if let Some(entries) = &self.entries {
            writeln!(f, "{} {}", TUPLES_MARKER, entries.len())?;
            for entry in entries {
                writeln!(f, "{} {}", entry.key, entry.value_text())?;
            }
        }
        writeln!(f, "{}", END_MARKER)
    }
}

struct Lines<'a> {
    inner: std::iter::Peekable<std::str::Lines<'a>>,
}

impl<'a> Lines<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            inner: text.lines().peekable(),
        }
    }

    fn peek(&mut self) -> Option<&'a str> {
        self.inner.peek().copied()
    }

    fn next(&mut self, what: &str) -> OverlayResult<&'a str> {
        self.inner
            .next()
            .ok_or_else(|| OverlayError::parse(format!("description ends before {}", what)))
    }

    fn expect_marker(&mut self, marker: &str) -> OverlayResult<()> {
        let line = self.next(marker)?;
        if line.trim() == marker {
            Ok(())
        } else {
            Err(OverlayError::parse(format!(
                "expected {} but found {:?}",
                marker, line
            )))
        }
    }

    fn number(&mut self, what: &str) -> OverlayResult<f64> {
        let line = self.next(what)?;
        line.trim()
            .parse()
            .map_err(|e| OverlayError::parse(format!("bad {} {:?}: {}", what, line, e)))
    }
}
