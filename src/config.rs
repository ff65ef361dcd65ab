use clap::Parser;
use std::time::Duration;

use crate::error::{OverlayError, OverlayResult};
use crate::overlay::types::Address;
use crate::storage::types::{Key, MAX_DIMS};

/// Command-line configuration of an overlay node.
///
/// Without `--remote` the node starts as the root of a new overlay owning
/// `[low, high)^dims`; with it, the node joins the overlay through that peer.
#[derive(Parser, Debug, Clone)]
#[command(name = "overlay-node", version, about = "Space-partitioned multidimensional index node")]
pub struct NodeConfig {
    /// Dimensionality of the key space
    #[arg(short = 'd', long)]
    pub dims: usize,

    /// Lower bound of every coordinate
    #[arg(short = 'l', long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub low: f64,

    /// Upper bound (exclusive) of every coordinate
    #[arg(short = 'g', long, default_value_t = 1.0, allow_negative_numbers = true)]
    pub high: f64,

    /// Host name other nodes use to reach this one
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Listening port, 0 picks a free one
    #[arg(short = 'p', long, default_value_t = 0)]
    pub port: u16,

    /// Host of an existing node to join through
    #[arg(short = 'r', long)]
    pub remote: Option<String>,

    /// Port of the existing node given by --remote
    #[arg(short = 'a', long = "at")]
    pub remote_port: Option<u16>,

    /// Prefer IPv6 loopback when no host is given
    #[arg(short = '6', long)]
    pub ipv6: bool,

    /// How long to wait for a peer's reply, in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub receive_timeout_ms: u64,
}

impl NodeConfig {
    /// Root node configuration on loopback with an ephemeral port.
    pub fn local(dims: usize) -> Self {
        Self {
            dims,
            low: 0.0,
            high: 1.0,
            host: None,
            port: 0,
            remote: None,
            remote_port: None,
            ipv6: false,
            receive_timeout_ms: 5000,
        }
    }

    pub fn joining(mut self, remote: &Address) -> Self {
        self.remote = Some(remote.host.clone());
        self.remote_port = Some(remote.port);
        self
    }

    pub fn validate(&self) -> OverlayResult<()> {
        if !(1..=MAX_DIMS).contains(&self.dims) {
            return Err(OverlayError::config(format!(
                "dims must be in 1..={}, got {}",
                MAX_DIMS, self.dims
            )));
        }
        if self.low.is_nan() || self.high.is_nan() || self.low >= self.high {
            return Err(OverlayError::config(format!(
                "low ({}) must be below high ({})",
                self.low, self.high
            )));
        }
        if self.remote.is_some() != self.remote_port.is_some() {
            return Err(OverlayError::config(
                "--remote and --at must be given together",
            ));
        }
        if self.receive_timeout_ms == 0 {
            return Err(OverlayError::config("receive timeout must be positive"));
        }
        Ok(())
    }

    pub fn host(&self) -> String {
        match &self.host {
            Some(host) => host.clone(),
            None if self.ipv6 => "::1".to_string(),
            None => "127.0.0.1".to_string(),
        }
    }

    pub fn listen_address(&self) -> Address {
        Address::new(self.host(), self.port)
    }

    pub fn remote_address(&self) -> Option<Address> {
        match (&self.remote, self.remote_port) {
            (Some(host), Some(port)) => Some(Address::new(host.clone(), port)),
            _ => None,
        }
    }

    pub fn bounds(&self) -> (Key, Key) {
        (
            Key::splat(self.dims, self.low),
            Key::splat(self.dims, self.high),
        )
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}
