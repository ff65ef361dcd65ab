//! Overlay Wire Protocol
//!
//! Newline-framed text over TCP.
//!
//! ## Submodules
//! - `connection`: line-oriented reads and writes with a bounded reply wait.
//! - `message`: request tags, parsing and formatting of request lines.
//! - `description`: the `#AREA`/`#NODE`/`#TUPLES` node description block.
//! - `answer`: `#ACK` query answers pushed to reply addresses.

pub mod answer;
pub mod connection;
pub mod description;
pub mod message;

#[cfg(test)]
mod tests;
