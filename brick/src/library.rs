// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The operations the graph controller needs from the brick library.

use crate::{Brick, BrickError, FirewallFlags, Side, TxCapabilities};
use net::{Mac, Vni};
use std::fs::File;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

/// The external packet-processing library, seen through the operations the
/// controller performs on it.
///
/// Implementations must be callable from two threads: the control thread
/// creates bricks and stages firewall rules, the polling worker executes
/// everything routed through the command queue. Brick mutation (link,
/// unlink, destroy, reload, poll) is only ever invoked from the worker once
/// it runs; the byte counters must be readable concurrently with polling.
pub trait BrickLibrary: Send + Sync {
    /// Initialize the library (EAL arguments for a DPDK-backed
    /// implementation). Must be called once before any brick is created.
    fn init(&self, args: &[String]) -> Result<(), BrickError>;
    /// Tear the library down. All bricks must have been destroyed.
    fn shutdown(&self);

    /// Bring up the vhost-user subsystem with its socket directory.
    fn vhost_start(&self, socket_dir: &Path) -> Result<(), BrickError>;
    fn vhost_stop(&self);
    /// Globally withdraw virtio feature bits from vhost endpoints.
    fn vhost_disable_features(&self, features: u64);

    /// Create the physical uplink brick bound to a DPDK port.
    fn nic_new_by_port(&self, name: &str, port: u16) -> Result<Brick, BrickError>;
    /// Create a kernel tap brick. `ifname` requests a specific interface
    /// name; `None` lets the kernel pick one.
    fn tap_new(&self, name: &str, ifname: Option<&str>) -> Result<Brick, BrickError>;
    fn vhost_new(&self, name: &str) -> Result<Brick, BrickError>;
    /// Create the VXLAN tunnel endpoint bound to `local_ip`. The address
    /// family of `local_ip` decides whether the brick is a
    /// [`BrickKind::Vtep4`](crate::BrickKind::Vtep4) or a
    /// [`BrickKind::Vtep6`](crate::BrickKind::Vtep6).
    fn vtep_new(&self, name: &str, local_ip: IpAddr, mac: Mac) -> Result<Brick, BrickError>;
    fn switch_new(
        &self,
        name: &str,
        west_max: u32,
        east_max: u32,
        side: Side,
    ) -> Result<Brick, BrickError>;
    fn firewall_new(
        &self,
        name: &str,
        west_max: u32,
        east_max: u32,
        flags: FirewallFlags,
    ) -> Result<Brick, BrickError>;
    /// Create an ARP anti-spoofing brick guarding `mac` on the given side.
    fn antispoof_new(&self, name: &str, side: Side, mac: Mac) -> Result<Brick, BrickError>;
    /// Create a pcap printer writing to `output`. The brick owns the file
    /// and closes it on destruction.
    fn print_new(&self, name: &str, output: File) -> Result<Brick, BrickError>;

    /// Connect west's east-side port to east's west-side port.
    fn link(&self, west: &Brick, east: &Brick) -> Result<(), BrickError>;
    /// Link a run of bricks pairwise, west to east.
    fn chained_links(&self, bricks: &[&Brick]) -> Result<(), BrickError> {
        for pair in bricks.windows(2) {
            self.link(pair[0], pair[1])?;
        }
        Ok(())
    }
    /// Remove every edge of `brick`.
    fn unlink(&self, brick: &Brick) -> Result<(), BrickError>;
    /// Remove only the (west, east) edge.
    fn unlink_edge(&self, west: &Brick, east: &Brick) -> Result<(), BrickError>;
    /// Destroy a brick. Only the polling worker calls this.
    fn brick_destroy(&self, brick: &Brick);

    /// Drive one poll round on a pollable brick; returns the packet count.
    fn poll(&self, brick: &Brick) -> Result<u16, BrickError>;
    /// Collect expired connection-tracking state of a firewall.
    fn firewall_gc(&self, firewall: &Brick);

    /// Stage a filter expression on a firewall side. Staged rules take
    /// effect at the next [`firewall_reload`](Self::firewall_reload); the
    /// reload is the only call that publishes them to the datapath.
    fn firewall_rule_add(
        &self,
        firewall: &Brick,
        expr: &str,
        side: Side,
        priority: u32,
    ) -> Result<(), BrickError>;
    /// Drop all staged rules.
    fn firewall_rule_flush(&self, firewall: &Brick);
    /// Recompile and publish the staged rules.
    fn firewall_reload(&self, firewall: &Brick) -> Result<(), BrickError>;

    /// Register `neighbor` as the graph-side peer of `vni` on the tunnel
    /// endpoint, joining the given multicast group for cross-host flooding.
    fn vtep_add_vni(
        &self,
        vtep: &Brick,
        neighbor: &Brick,
        vni: Vni,
        mcast_group: IpAddr,
    ) -> Result<(), BrickError>;

    fn antispoof_arp_add(&self, antispoof: &Brick, ip: Ipv4Addr) -> Result<(), BrickError>;
    fn antispoof_arp_del_all(&self, antispoof: &Brick);
    fn antispoof_arp_enable(&self, antispoof: &Brick);
    fn antispoof_arp_disable(&self, antispoof: &Brick);

    fn nic_get_mac(&self, nic: &Brick) -> Mac;
    fn nic_set_mtu(&self, nic: &Brick, mtu: u32) -> Result<(), BrickError>;
    fn nic_get_mtu(&self, nic: &Brick) -> Result<u16, BrickError>;
    fn nic_tx_capabilities(&self, nic: &Brick) -> TxCapabilities;

    /// Unix socket path of a vhost-user brick.
    fn vhost_socket_path(&self, vhost: &Brick) -> String;
    /// Kernel interface name of a tap brick.
    fn tap_ifname(&self, tap: &Brick) -> String;
    fn tap_get_mac(&self, tap: &Brick) -> Result<Mac, BrickError>;

    /// Bytes received by the brick. Atomic with respect to polling.
    fn rx_bytes(&self, brick: &Brick) -> u64;
    /// Bytes transmitted by the brick. Atomic with respect to polling.
    fn tx_bytes(&self, brick: &Brick) -> u64;

    /// Serialize the connected component of `root` in graphviz DOT form.
    fn dot(&self, root: &Brick) -> String;
}
