// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Virtual-network data-plane graph controller.
//!
//! The controller owns a directed graph of packet-processing bricks carrying
//! traffic between a physical uplink and per-tenant virtual NICs grouped by
//! VXLAN network identifier. A single polling worker runs the graph at line
//! rate; the control thread never touches live bricks directly but routes
//! every mutation through a typed command queue the worker drains between
//! poll rounds. See [`Graph`] for the entry point.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod branch;
mod command;
mod config;
mod errors;
mod graph;
mod handle;
pub mod model;
mod poller;
mod rules;
mod topology;

// re-exports
pub use config::{GraphConfig, GraphConfigBuilder, InvalidMtuRequest, MtuRequest};
pub use errors::GraphError;
pub use graph::Graph;
pub use model::{
    Direction, Model, Nic, NicBuilder, NicType, PortRange, Protocol, Rule, SecurityGroup,
};
