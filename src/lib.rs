//! Space-Partitioned Multidimensional Index
//!
//! A peer-to-peer overlay storing values under D-dimensional points. Each
//! node owns a half-open box of the key space; boxes are created by halving
//! an existing node's box when a peer joins and recombined when it leaves.
//!
//! ## Architecture Modules
//! - **`storage`**: the local multidimensional search tree and the region wrapped around it.
//! - **`protocol`**: the newline-framed text protocol, node descriptions and query answers.
//! - **`overlay`**: node state, routing, join/departure and the TCP service.
//! - **`config`**: command-line configuration of a node.
//! - **`error`**: the error type shared by every layer.

pub mod config;
pub mod error;
pub mod overlay;
pub mod protocol;
pub mod storage;
