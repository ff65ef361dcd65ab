//! Request lines exchanged between nodes and clients.
//!
//! Every request starts with a one-letter tag. `O` and `G` are followed by
//! a node description terminated by `#END`; all others fit on one line.

use std::fmt;

use super::description::NodeDescription;
use crate::error::{OverlayError, OverlayResult};
use crate::overlay::types::{Address, NodeId};
use crate::storage::types::{Key, Value};

pub const END_MARKER: &str = "#END";
pub const ACK_MARKER: &str = "#ACK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Insert,
    Append,
    Lookup,
    Range,
    Nearest,
    Whois,
    Dump,
    Maintenance,
    Merge,
    Join,
    Depart,
}

impl Tag {
    pub fn from_line(line: &str) -> OverlayResult<Self> {
        let tag = match line.chars().next() {
            Some('U') => Tag::Insert,
            Some('A') => Tag::Append,
            Some('L') => Tag::Lookup,
            Some('R') => Tag::Range,
            Some('N') => Tag::Nearest,
            Some('W') => Tag::Whois,
            Some('M') => Tag::Dump,
            Some('O') => Tag::Maintenance,
            Some('G') => Tag::Merge,
            Some('S') => Tag::Join,
            Some('Q') => Tag::Depart,
            _ => {
                return Err(OverlayError::parse(format!(
                    "unknown request {:?}",
                    line
                )))
            }
        };
        Ok(tag)
    }

    pub fn as_char(self) -> char {
        match self {
            Tag::Insert => 'U',
            Tag::Append => 'A',
            Tag::Lookup => 'L',
            Tag::Range => 'R',
            Tag::Nearest => 'N',
            Tag::Whois => 'W',
            Tag::Dump => 'M',
            Tag::Maintenance => 'O',
            Tag::Merge => 'G',
            Tag::Join => 'S',
            Tag::Depart => 'Q',
        }
    }

    /// Whether a description block follows the request line.
    pub fn carries_description(self) -> bool {
        matches!(self, Tag::Maintenance | Tag::Merge)
    }

    pub fn ok(self) -> String {
        format!("{} OK\n", self.as_char())
    }

    pub fn bad(self) -> String {
        format!("{} BAD\n", self.as_char())
    }

    pub fn is_ok_reply(self, reply: &str) -> bool {
        reply.trim_end() == self.ok().trim_end()
    }
}

#[derive(Debug, Clone)]
pub enum Request {
    Insert {
        key: Key,
        value: Value,
    },
    Append {
        key: Key,
        value: Value,
    },
    Lookup {
        key: Key,
        reply: Address,
        hops: u32,
    },
    Range {
        lo: Key,
        hi: Key,
        reply: Address,
        hops: u32,
    },
    Nearest {
        center: Key,
        k: usize,
        radius: f64,
        reply: Address,
        hops: u32,
        /// First split level still to be explored.
        depth: usize,
    },
    Whois,
    Dump,
    Maintenance {
        sender: NodeId,
        description: NodeDescription,
    },
    Merge {
        target: NodeId,
        description: NodeDescription,
    },
    Join {
        joiner: Address,
    },
    Depart,
}

impl Request {
    pub fn tag(&self) -> Tag {
        match self {
            Request::Insert { .. } => Tag::Insert,
            Request::Append { .. } => Tag::Append,
            Request::Lookup { .. } => Tag::Lookup,
            Request::Range { .. } => Tag::Range,
            Request::Nearest { .. } => Tag::Nearest,
            Request::Whois => Tag::Whois,
            Request::Dump => Tag::Dump,
            Request::Maintenance { .. } => Tag::Maintenance,
            Request::Merge { .. } => Tag::Merge,
            Request::Join { .. } => Tag::Join,
            Request::Depart => Tag::Depart,
        }
    }

    /// Parses a request line (without its newline). `body` is the
    /// description block for `O` and `G`.
    pub fn parse(line: &str, body: Option<&str>, dims: usize) -> OverlayResult<Self> {
        let tag = Tag::from_line(line)?;
        let mut cursor = Cursor::new(line, 1);

        let request = match tag {
            Tag::Insert | Tag::Append => {
                cursor.expect('(')?;
                let key = Key::parse_dims(cursor.until(')')?, dims)?;
                let value = cursor.remainder().as_bytes().to_vec();
                if tag == Tag::Insert {
                    Request::Insert { key, value }
                } else {
                    Request::Append { key, value }
                }
            }
            Tag::Lookup => {
                cursor.expect('(')?;
                let key = Key::parse_dims(cursor.until(')')?, dims)?;
                let reply = cursor.address()?;
                let hops = cursor.number("hops")?;
                Request::Lookup { key, reply, hops }
            }
            Tag::Range => {
                cursor.expect('(')?;
                cursor.expect('(')?;
                let lo = Key::parse_dims(cursor.until(')')?, dims)?;
                cursor.expect(',')?;
                cursor.expect('(')?;
                let hi = Key::parse_dims(cursor.until(')')?, dims)?;
                cursor.expect(')')?;
                let reply = cursor.address()?;
                let hops = cursor.number("hops")?;
                Request::Range { lo, hi, reply, hops }
            }
            Tag::Nearest => {
                cursor.expect('(')?;
                cursor.expect('(')?;
                let center = Key::parse_dims(cursor.until(')')?, dims)?;
                cursor.expect(',')?;
                let k = parse_field(cursor.until(',')?, "neighbour count")?;
                let radius = parse_field(cursor.until(')')?, "radius")?;
                let reply = cursor.address()?;
                let hops = cursor.number("hops")?;
                let depth = match cursor.word() {
                    Some(word) => parse_field(word, "depth")?,
                    None => 0,
                };
                Request::Nearest {
                    center,
                    k,
                    radius,
                    reply,
                    hops,
                    depth,
                }
            }
            Tag::Whois => Request::Whois,
            Tag::Dump => Request::Dump,
            Tag::Depart => Request::Depart,
            Tag::Join => Request::Join {
                joiner: cursor.address()?,
            },
            Tag::Maintenance | Tag::Merge => {
                let id = NodeId::parse(cursor.remainder())?;
                let body = body.ok_or_else(|| {
                    OverlayError::parse(format!("{:?} carries no description", line))
                })?;
                let description = NodeDescription::parse(body, dims)?;
                if tag == Tag::Maintenance {
                    Request::Maintenance {
                        sender: id,
                        description,
                    }
                } else {
                    Request::Merge {
                        target: id,
                        description,
                    }
                }
            }
        };
        Ok(request)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Insert { key, value } => {
                writeln!(f, "U({}){}", key, String::from_utf8_lossy(value))
            }
            Request::Append { key, value } => {
                writeln!(f, "A({}){}", key, String::from_utf8_lossy(value))
            }
            Request::Lookup { key, reply, hops } => {
                writeln!(f, "L({}) {} {}", key, reply.wire(), hops)
            }
            Request::Range { lo, hi, reply, hops } => {
                writeln!(f, "R(({}),({})) {} {}", lo, hi, reply.wire(), hops)
            }
            Request::Nearest {
                center,
                k,
                radius,
                reply,
                hops,
                depth,
            } => writeln!(
                f,
                "N(({}),{},{}) {} {} {}",
                center,
                k,
                radius,
                reply.wire(),
                hops,
                depth
            ),
            Request::Whois => writeln!(f, "W"),
            Request::Dump => writeln!(f, "M"),
            Request::Depart => writeln!(f, "Q"),
            Request::Join { joiner } => writeln!(f, "S {}", joiner.wire()),
            Request::Maintenance {
                sender,
                description,
            } => write!(f, "O {}\n{}", sender, description),
            Request::Merge {
                target,
                description,
            } => write!(f, "G {}\n{}", target, description),
        }
    }
}

fn parse_field<T>(text: &str, what: &str) -> OverlayResult<T>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    text.trim()
        .parse::<T>()
        .map_err(|e| OverlayError::parse(format!("bad {} {:?}: {}", what, text, e)))
}

/// Minimal scanner over a request line.
struct Cursor<'a> {
    line: &'a str,
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str, skip: usize) -> Self {
        Self {
            line,
            rest: line.get(skip..).unwrap_or(""),
        }
    }

    fn error(&self, what: &str) -> OverlayError {
        OverlayError::parse(format!("{} in {:?}", what, self.line))
    }

    fn expect(&mut self, symbol: char) -> OverlayResult<()> {
        match self.rest.trim_start().strip_prefix(symbol) {
            Some(rest) => {
                self.rest = rest;
                Ok(())
            }
            None => Err(self.error(&format!("expected {:?}", symbol))),
        }
    }

    fn until(&mut self, symbol: char) -> OverlayResult<&'a str> {
        match self.rest.split_once(symbol) {
            Some((head, tail)) => {
                self.rest = tail;
                Ok(head)
            }
            None => Err(self.error(&format!("missing {:?}", symbol))),
        }
    }

    fn word(&mut self) -> Option<&'a str> {
        let trimmed = self.rest.trim_start();
        if trimmed.is_empty() {
            return None;
        }
        let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
        let (word, tail) = trimmed.split_at(end);
        self.rest = tail;
        Some(word)
    }

    fn address(&mut self) -> OverlayResult<Address> {
        let host = self.word().ok_or_else(|| self.error("missing host"))?;
        let port = self.word().ok_or_else(|| self.error("missing port"))?;
        Address::from_wire(host, port)
    }

    fn number(&mut self, what: &str) -> OverlayResult<u32> {
        let word = self
            .word()
            .ok_or_else(|| self.error(&format!("missing {}", what)))?;
        parse_field(word, what)
    }

    fn remainder(self) -> &'a str {
        self.rest
    }
}
