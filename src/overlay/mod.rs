//! Overlay Module
//!
//! The peer-to-peer layer: every node owns one region of the key space and
//! routes requests for other regions along its split history.
//!
//! ## Submodules
//! - `types`: addresses, split sides, node ids and split records.
//! - `node`: per-node state with split, merge and routing computations.
//! - `service`: the server loop, connection workers, links and departure.
//! - `handlers`: one handler per request tag.

pub mod handlers;
pub mod node;
pub mod service;
pub mod types;

#[cfg(test)]
mod tests;
