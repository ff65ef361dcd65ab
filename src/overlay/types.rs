use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{OverlayError, OverlayResult};
use crate::protocol::connection::Connection;

/// Where a node accepts connections.
///
/// Displayed as `host:port`; the wire form used inside messages and
/// descriptions is `host port` (see [`Address::wire`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn wire(&self) -> String {
        format!("{} {}", self.host, self.port)
    }

    pub fn from_wire(host: &str, port: &str) -> OverlayResult<Self> {
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|e| OverlayError::parse(format!("bad port {:?}: {}", port, e)))?;
        if host.trim().is_empty() {
            return Err(OverlayError::parse("empty host"));
        }
        Ok(Self::new(host.trim(), port))
    }

    /// `host:port`, bracketing IPv6 literals for socket APIs.
    pub fn socket_string(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Which side of a split a node kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Half {
    /// Coordinates below the boundary. Written as `0`.
    Lower,
    /// Coordinates at or above the boundary. Written as `1`.
    Upper,
}

impl Half {
    pub fn opposite(self) -> Self {
        match self {
            Half::Lower => Half::Upper,
            Half::Upper => Half::Lower,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Half::Lower => '0',
            Half::Upper => '1',
        }
    }

    /// Whether `coord` falls on the other side of `boundary`.
    pub fn excludes(self, coord: f64, boundary: f64) -> bool {
        match self {
            Half::Lower => coord >= boundary,
            Half::Upper => coord < boundary,
        }
    }
}

/// Binary split history of a node, e.g. `"101"`. The root's id is empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn from_halves<'a>(halves: impl IntoIterator<Item = &'a Half>) -> Self {
        Self(halves.into_iter().map(|h| h.as_char()).collect())
    }

    pub fn parse(text: &str) -> OverlayResult<Self> {
        let text = text.trim();
        if let Some(bad) = text.chars().find(|c| *c != '0' && *c != '1') {
            return Err(OverlayError::parse(format!(
                "node id {:?} contains {:?}",
                text, bad
            )));
        }
        Ok(Self(text.to_string()))
    }

    pub fn halves(&self) -> Vec<Half> {
        self.0
            .chars()
            .map(|c| if c == '1' { Half::Upper } else { Half::Lower })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Id of the sibling produced by the most recent split.
    pub fn sibling(&self) -> Option<NodeId> {
        let mut halves = self.halves();
        let last = halves.pop()?;
        halves.push(last.opposite());
        Some(Self::from_halves(&halves))
    }

    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        self.0
            .chars()
            .zip(other.0.chars())
            .take_while(|(a, b)| a == b)
            .count()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persistent connection to the node on the far side of a split.
pub type PeerLink = Arc<Mutex<Connection>>;

/// One level of a node's split history.
#[derive(Clone)]
pub struct SplitRecord {
    /// Side of the boundary this node kept.
    pub side: Half,
    pub boundary: f64,
    /// Last known node on the other side.
    pub sibling: Address,
    /// `None` until linked, or after the link failed.
    pub link: Option<PeerLink>,
}

impl SplitRecord {
    pub fn new(side: Half, boundary: f64, sibling: Address) -> Self {
        Self {
            side,
            boundary,
            sibling,
            link: None,
        }
    }

    /// Copy without the connection, for handing to another node.
    pub fn detached(&self) -> Self {
        Self::new(self.side, self.boundary, self.sibling.clone())
    }
}

impl fmt::Debug for SplitRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitRecord")
            .field("side", &self.side)
            .field("boundary", &self.boundary)
            .field("sibling", &self.sibling)
            .field("linked", &self.link.is_some())
            .finish()
    }
}
