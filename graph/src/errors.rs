// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Controller error type.

use brick::BrickError;

/// Errors surfaced by the graph controller.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("graph has not been started")]
    NotStarted,
    #[error("graph is already started")]
    AlreadyStarted,
    #[error("nic '{id}' in vni {vni} does not exist")]
    NoSuchNic { id: String, vni: u32 },
    #[error("vni {vni} violates the switch invariant")]
    SwitchInvariant { vni: u32 },
    #[error("firewall creation failed for nic '{0}'")]
    FirewallCreation(String),
    #[error("packet tracing requested for nic '{0}' but no trace path is set")]
    MissingTracePath(String),
    #[error("nic '{0}' has no sniffer brick")]
    NoSniffer(String),
    #[error("no filter could be built from the rule for nic '{0}'")]
    EmptyRule(String),
    #[error("brick library: {0}")]
    Brick(#[from] BrickError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("export serialization: {0}")]
    Export(#[from] serde_json::Error),
}
