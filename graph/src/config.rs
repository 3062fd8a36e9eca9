// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Controller configuration.

use derive_builder::Builder;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Requested MTU for the physical uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum MtuRequest {
    /// Probe for the largest MTU the device accepts.
    Max,
    /// Set this exact value.
    Fixed(u32),
}

/// Error parsing an MTU request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("bad mtu request '{0}': expected \"max\" or a positive integer")]
pub struct InvalidMtuRequest(String);

impl FromStr for MtuRequest {
    type Err = InvalidMtuRequest;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input == "max" {
            return Ok(MtuRequest::Max);
        }
        match input.parse::<u32>() {
            Ok(mtu) if mtu > 0 => Ok(MtuRequest::Fixed(mtu)),
            _ => Err(InvalidMtuRequest(input.to_string())),
        }
    }
}

impl TryFrom<String> for MtuRequest {
    type Error = InvalidMtuRequest;

    fn try_from(input: String) -> Result<Self, Self::Error> {
        input.parse()
    }
}

/// Static configuration of the graph controller.
#[derive(Debug, Clone, Builder, Deserialize)]
pub struct GraphConfig {
    /// Address the VXLAN tunnel endpoint binds to. Its family decides
    /// whether the endpoint runs in IPv4 or IPv6 mode.
    pub external_ip: IpAddr,
    /// DPDK port of the physical uplink. `None` skips the port probe and
    /// uses a kernel tap as uplink directly.
    #[builder(default)]
    pub dpdk_port: Option<u16>,
    /// Arguments handed to the packet-processing library at init.
    #[builder(default)]
    pub dpdk_args: Vec<String>,
    /// Directory the vhost-user sockets are created in.
    #[builder(default = "PathBuf::from(\"/var/run/vnet\")")]
    pub socket_dir: PathBuf,
    /// CPU core the polling worker is pinned to, if any.
    #[builder(default)]
    pub poller_core: Option<usize>,
    /// Uplink MTU request; `None` leaves the device default in place.
    #[builder(default)]
    pub nic_mtu: Option<MtuRequest>,
    /// Force host TSO off even when the uplink could offload.
    #[builder(default)]
    pub disable_offload: bool,
    /// Capture all tunnel traffic into the main pcap file.
    #[builder(default)]
    pub packet_trace: bool,
    /// Filename prefix of the main pcap file in `/tmp`.
    #[builder(default = "String::from(\"vnet\")")]
    pub pcap_prefix: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn mtu_request_parses() {
        assert_eq!("max".parse::<MtuRequest>().unwrap(), MtuRequest::Max);
        assert_eq!("1500".parse::<MtuRequest>().unwrap(), MtuRequest::Fixed(1500));
        assert!("0".parse::<MtuRequest>().is_err());
        assert!("jumbo".parse::<MtuRequest>().is_err());
    }

    #[test]
    fn builder_defaults() {
        let config = GraphConfigBuilder::default()
            .external_ip("192.0.2.1".parse::<IpAddr>().unwrap())
            .build()
            .unwrap();
        assert!(config.dpdk_port.is_none());
        assert!(!config.packet_trace);
        assert_eq!(config.pcap_prefix, "vnet");
    }
}
