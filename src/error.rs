//! Overlay Error Types
//!
//! A single error enum shared by the storage, protocol and overlay layers.
//! Only [`OverlayError::Parse`] is fatal to the connection it was read from;
//! every other failure is answered with a negative acknowledgment.

use std::io;

use thiserror::Error;

pub type OverlayResult<T> = Result<T, OverlayError>;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("protocol violation: {0}")]
    Parse(String),

    #[error("unable to route: {0}")]
    Routing(String),

    #[error("link at level {level} to {address} failed: {reason}")]
    Link {
        level: usize,
        address: String,
        reason: String,
    },

    #[error("merge refused: {0}")]
    MergeIncompatible(String),

    #[error("invalid region: {0}")]
    InvalidRegion(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("negative acknowledgment from {peer}: {reply}")]
    Rejected { peer: String, reply: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl OverlayError {
    pub fn parse(msg: impl Into<String>) -> Self {
        OverlayError::Parse(msg.into())
    }

    pub fn routing(msg: impl Into<String>) -> Self {
        OverlayError::Routing(msg.into())
    }

    pub fn link(level: usize, address: impl ToString, reason: impl ToString) -> Self {
        OverlayError::Link {
            level,
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn merge(msg: impl Into<String>) -> Self {
        OverlayError::MergeIncompatible(msg.into())
    }

    pub fn region(msg: impl Into<String>) -> Self {
        OverlayError::InvalidRegion(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        OverlayError::InvalidConfig(msg.into())
    }

    /// True when the connection that produced this error must be dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OverlayError::Parse(_))
    }
}
