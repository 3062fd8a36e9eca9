// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Strongly typed network primitives shared by the virtual-network dataplane.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

pub mod eth;
pub mod ip;
pub mod vxlan;

// re-exports
pub use eth::{InvalidMac, Mac};
pub use ip::{Cidr, InvalidCidr};
pub use vxlan::{InvalidVni, Vni};
