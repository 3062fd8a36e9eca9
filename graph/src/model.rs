// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The NIC and security-group model the controller reads.
//!
//! The model is owned by the service façade; the controller consumes it to
//! translate NICs into brick branches and security groups into firewall
//! filters. Nothing here is persisted by the controller.

use ahash::RandomState;
use derive_builder::Builder;
use net::{Cidr, Mac, Vni};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

/// How the guest-facing end of a NIC branch is realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NicType {
    /// vhost-user socket in server mode.
    VhostUserServer,
    /// Kernel tap device named after the NIC id.
    Tap,
}

/// Traffic direction a rule applies to, seen from the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Protocol selector of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Match any protocol.
    Any,
    Icmp,
    Icmp6,
    Tcp,
    Udp,
    /// Any other IP protocol number.
    Other(u8),
}

/// Destination port range of a TCP/UDP rule.
///
/// Bounds are carried wider than `u16` so that out-of-range input from the
/// façade reaches the compiler and is rejected there, not silently truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u32,
    pub end: u32,
}

/// One security-group rule.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
pub struct Rule {
    pub direction: Direction,
    #[builder(default = "Protocol::Any")]
    pub protocol: Protocol,
    /// Source network; `None` when the rule references a security group.
    #[builder(default)]
    pub cidr: Option<Cidr>,
    /// Source security group; expanded to its member addresses.
    #[builder(default)]
    pub security_group: Option<String>,
    /// Destination ports, TCP/UDP only.
    #[builder(default)]
    pub ports: Option<PortRange>,
}

/// A security group: a set of member addresses and the rules they imply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub members: Vec<IpAddr>,
    pub rules: Vec<Rule>,
}

/// A virtual NIC as the façade describes it.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
pub struct Nic {
    pub id: String,
    pub mac: Mac,
    pub vni: Vni,
    pub nic_type: NicType,
    #[builder(default)]
    pub ip_list: Vec<IpAddr>,
    #[builder(default)]
    pub security_groups: Vec<String>,
    /// Restrict ARP on the branch to the addresses in `ip_list`.
    #[builder(default)]
    pub ip_anti_spoof: bool,
    /// Skip the firewall/antispoof pair entirely.
    #[builder(default)]
    pub bypass_filtering: bool,
    /// Capture branch traffic into `packet_trace_path`.
    #[builder(default)]
    pub packet_trace: bool,
    #[builder(default)]
    pub packet_trace_path: Option<PathBuf>,
}

/// The model of record: all NICs and security groups, by id.
#[derive(Debug, Clone, Default)]
pub struct Model {
    pub nics: HashMap<String, Nic, RandomState>,
    pub security_groups: HashMap<String, SecurityGroup, RandomState>,
}

impl Model {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nics: HashMap::with_hasher(RandomState::with_seed(0)),
            security_groups: HashMap::with_hasher(RandomState::with_seed(0)),
        }
    }

    #[must_use]
    pub fn security_group(&self, id: &str) -> Option<&SecurityGroup> {
        self.security_groups.get(id)
    }
}
