//! Local Storage Module
//!
//! Holds the entries a node owns.
//!
//! ## Core Concepts
//! - **Key**: a point in D-dimensional space, compared coordinate-wise.
//! - **SpatialTree**: a `2^D`-ary search tree answering exact, box and nearest-neighbour queries.
//! - **Region**: the half-open box a node is responsible for, wrapping its tree and
//!   providing split points, partitioning and absorption for the overlay.

pub mod region;
pub mod tree;
pub mod types;
