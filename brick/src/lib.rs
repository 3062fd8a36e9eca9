// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Interface to the external packet-processing library.
//!
//! The dataplane is a graph of "bricks": packet-processing nodes created,
//! linked and polled through the [`BrickLibrary`] trait. This crate owns the
//! opaque [`Brick`] handle, the vocabulary types shared with the library
//! (sides, flags, capabilities) and an in-memory [`testing::TestLibrary`]
//! implementation that records every call for use in tests.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

mod library;
pub mod testing;

pub use library::BrickLibrary;

use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

/// The processing role of a brick in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrickKind {
    /// Physical uplink port.
    Nic,
    /// Kernel tap device.
    Tap,
    /// vhost-user endpoint.
    Vhost,
    /// VXLAN tunnel endpoint over IPv4.
    Vtep4,
    /// VXLAN tunnel endpoint over IPv6.
    Vtep6,
    /// Filtering firewall.
    Firewall,
    /// ARP anti-spoofing guard.
    Antispoof,
    /// Multi-port L2 forwarder.
    Switch,
    /// Pcap printer/sniffer.
    Print,
}

#[derive(Debug)]
struct Node {
    name: String,
    kind: BrickKind,
}

/// An opaque, cheaply clonable handle to a brick owned by the library.
///
/// Identity is node identity: two handles compare equal iff they refer to
/// the same underlying brick, regardless of name.
#[derive(Clone)]
pub struct Brick {
    inner: Arc<Node>,
}

impl Brick {
    /// Create a brick node. Called by [`BrickLibrary`] implementations only;
    /// the controller obtains bricks from the library constructors.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: BrickKind) -> Self {
        Self {
            inner: Arc::new(Node {
                name: name.into(),
                kind,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn kind(&self) -> BrickKind {
        self.inner.kind
    }
}

impl PartialEq for Brick {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Brick {}

impl std::hash::Hash for Brick {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.inner), state);
    }
}

impl Debug for Brick {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Brick({} {:?})", self.inner.name, self.inner.kind)
    }
}

impl Display for Brick {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.name)
    }
}

/// The two sides of a brick. Traffic entering a branch from the tunnel comes
/// in on the west side; traffic leaving the guest goes out east.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    West,
    East,
}

impl Display for Side {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::West => write!(f, "west"),
            Side::East => write!(f, "east"),
        }
    }
}

/// Firewall creation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FirewallFlags(u64);

impl FirewallFlags {
    pub const NONE: FirewallFlags = FirewallFlags(0);
    /// Do not spawn a per-firewall connection-tracking worker thread.
    pub const NO_CONN_WORKER: FirewallFlags = FirewallFlags(1);

    #[must_use]
    pub fn contains(self, other: FirewallFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FirewallFlags {
    type Output = FirewallFlags;

    fn bitor(self, rhs: FirewallFlags) -> FirewallFlags {
        FirewallFlags(self.0 | rhs.0)
    }
}

/// Transmit offloads reported by the uplink port.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxCapabilities {
    pub ipv4_cksum: bool,
    pub tcp_tso: bool,
}

/// Virtio feature bits the controller may globally withdraw from vhost
/// endpoints when the uplink cannot offload segmentation.
pub mod virtio {
    pub const VIRTIO_NET_F_HOST_TSO4: u64 = 1 << 11;
    pub const VIRTIO_NET_F_HOST_TSO6: u64 = 1 << 12;
}

/// Errors surfaced by the brick library.
#[derive(Debug, thiserror::Error)]
pub enum BrickError {
    #[error("brick library is not initialized")]
    NotInitialized,
    #[error("failed to create brick '{name}': {reason}")]
    CreationFailed { name: String, reason: String },
    #[error("cannot link '{west}' to '{east}': {reason}")]
    LinkFailed {
        west: String,
        east: String,
        reason: String,
    },
    #[error("no edge between '{west}' and '{east}'")]
    NoSuchEdge { west: String, east: String },
    #[error("invalid operation on brick '{brick}': {reason}")]
    InvalidOperation { brick: String, reason: String },
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn brick_identity_is_node_identity() {
        let a = Brick::new("fw", BrickKind::Firewall);
        let b = Brick::new("fw", BrickKind::Firewall);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn firewall_flags_compose() {
        let flags = FirewallFlags::NONE | FirewallFlags::NO_CONN_WORKER;
        assert!(flags.contains(FirewallFlags::NO_CONN_WORKER));
        assert!(!FirewallFlags::NONE.contains(FirewallFlags::NO_CONN_WORKER));
    }
}
