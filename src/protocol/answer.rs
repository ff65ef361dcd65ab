//! Query answers.
//!
//! Answers are pushed on a fresh connection to the reply address named in
//! the query:
//!
//! ```text
//! #ACK
//! #QUERY: <request line>
//! #HOPS: <n>
//! #HOST: <host>:<port>
//! #ID: <split history>
//! (key(0.2,0.3),[x])
//! (distance(0.1),key(0.2,0.3),[x])
//! #END
//! ```

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpListener;

use super::connection::Connection;
use super::message::{ACK_MARKER, END_MARKER};
use crate::error::{OverlayError, OverlayResult};
use crate::overlay::types::{Address, NodeId};
use crate::storage::types::{Entry, Key, Neighbor};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerItem {
    /// Set for nearest-neighbour results.
    pub distance: Option<f64>,
    pub key: Key,
    /// Empty for a lookup miss.
    pub value: String,
}

impl AnswerItem {
    pub fn from_entry(entry: &Entry) -> Self {
        Self {
            distance: None,
            key: entry.key.clone(),
            value: entry.value_text(),
        }
    }

    pub fn from_neighbor(neighbor: &Neighbor) -> Self {
        Self {
            distance: Some(neighbor.distance),
            ..Self::from_entry(&neighbor.entry)
        }
    }

    pub fn miss(key: &Key) -> Self {
        Self {
            distance: None,
            key: key.clone(),
            value: String::new(),
        }
    }

    fn parse(line: &str) -> OverlayResult<Self> {
        let bad = || OverlayError::parse(format!("bad answer line {:?}", line));
        let body = line
            .strip_prefix('(')
            .and_then(|l| l.strip_suffix("])"))
            .ok_or_else(bad)?;
        let (distance, body) = match body.strip_prefix("distance(") {
            Some(rest) => {
                let (d, rest) = rest.split_once("),").ok_or_else(bad)?;
                let d = d.trim().parse::<f64>().map_err(|_| bad())?;
                (Some(d), rest)
            }
            None => (None, body),
        };
        let body = body.strip_prefix("key(").ok_or_else(bad)?;
        let (key, value) = body.split_once("),[").ok_or_else(bad)?;
        Ok(Self {
            distance,
            key: key.parse()?,
            value: value.to_string(),
        })
    }
}

impl fmt::Display for AnswerItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.distance {
            Some(d) => writeln!(f, "(distance({}),key({}),[{}])", d, self.key, self.value),
            None => writeln!(f, "(key({}),[{}])", self.key, self.value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    /// The request line being answered, without its newline.
    pub query: String,
    pub hops: u32,
    pub host: String,
    pub id: NodeId,
    pub items: Vec<AnswerItem>,
}

impl Answer {
    pub fn new(query: &str, hops: u32, from: &Address, id: NodeId) -> Self {
        Self {
            query: query.trim_end().to_string(),
            hops,
            host: from.to_string(),
            id,
            items: Vec::new(),
        }
    }

    pub fn with_items(mut self, items: impl IntoIterator<Item = AnswerItem>) -> Self {
        self.items.extend(items);
        self
    }

    /// Parses one `#ACK` ... `#END` block.
    pub fn parse(text: &str) -> OverlayResult<Self> {
        let mut lines = text.lines();
        if lines.next().map(str::trim) != Some(ACK_MARKER) {
            return Err(OverlayError::parse("answer does not start with #ACK"));
        }
        let mut header = |name: &str| -> OverlayResult<String> {
            let prefix = format!("#{}:", name);
            lines
                .next()
                .and_then(|l| l.strip_prefix(prefix.as_str()))
                .map(|v| v.trim().to_string())
                .ok_or_else(|| OverlayError::parse(format!("answer lacks {}", prefix)))
        };
        let query = header("QUERY")?;
        let hops = header("HOPS")?
            .parse()
            .map_err(|e| OverlayError::parse(format!("bad hop count: {}", e)))?;
        let host = header("HOST")?;
        let id = NodeId::parse(&header("ID")?)?;

        let mut items = Vec::new();
        for line in lines {
            if line.trim() == END_MARKER {
                return Ok(Self {
                    query,
                    hops,
                    host,
                    id,
                    items,
                });
            }
            items.push(AnswerItem::parse(line)?);
        }
        Err(OverlayError::parse("answer lacks #END"))
    }

    /// Opens a connection to `reply` and pushes this answer.
    pub async fn deliver(&self, reply: &Address, receive_timeout: Duration) -> OverlayResult<()> {
        let mut conn = Connection::open(reply, receive_timeout).await?;
        conn.send(&self.to_string()).await?;
        conn.close().await;
        Ok(())
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", ACK_MARKER)?;
        writeln!(f, "#QUERY: {}", self.query)?;
        writeln!(f, "#HOPS: {}", self.hops)?;
        writeln!(f, "#HOST: {}", self.host)?;
        writeln!(f, "#ID: {}", self.id)?;
        for item in &self.items {
            write!(f, "{}", item)?;
        }
        writeln!(f, "{}", END_MARKER)
    }
}

/// Best `k` results over several nearest-neighbour answers, closest first.
/// A key reported by more than one node is kept once.
pub fn merge_nearest(answers: &[Answer], k: usize) -> Vec<AnswerItem> {
    let mut items: Vec<AnswerItem> = answers
        .iter()
        .flat_map(|a| a.items.iter())
        .filter(|item| item.distance.is_some())
        .cloned()
        .collect();
    items.sort_by(|a, b| {
        a.distance
            .unwrap_or(f64::INFINITY)
            .total_cmp(&b.distance.unwrap_or(f64::INFINITY))
    });
    let mut merged: Vec<AnswerItem> = Vec::with_capacity(k);
    for item in items {
        if merged.len() == k {
            break;
        }
        if !merged.iter().any(|m| m.key == item.key) {
            merged.push(item);
        }
    }
    merged
}

/// Collects answers arriving on `listener` until `window` passes without
/// a new connection.
pub async fn receive_answers(
    listener: &TcpListener,
    window: Duration,
    receive_timeout: Duration,
) -> Vec<Answer> {
    let mut answers = Vec::new();
    while let Ok(Ok((stream, peer))) = tokio::time::timeout(window, listener.accept()).await {
        let mut conn = Connection::new(stream, receive_timeout);
        match conn.recv_block().await {
            Ok(block) => match Answer::parse(&block) {
                Ok(answer) => answers.push(answer),
                Err(e) => tracing::warn!("Discarding malformed answer from {}: {}", peer, e),
            },
            Err(e) => tracing::warn!("Failed to read answer from {}: {}", peer, e),
        }
    }
    answers
}
