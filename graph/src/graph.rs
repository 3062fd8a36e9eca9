// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Graph lifecycle and the control-plane entry points.

use crate::branch::{build_branch, new_sniffer, splice_sniffer, unsplice_sniffer};
use crate::command::{CommandQueue, CommandReceiver, PollSnapshot, command_channel};
use crate::config::{GraphConfig, MtuRequest};
use crate::errors::GraphError;
use crate::handle::BrickHandle;
use crate::model::{Model, Nic, Rule};
use crate::poller::Poller;
use crate::rules;
use crate::topology::{GraphNic, TopologyCtx, VniTable};
use brick::{Brick, BrickKind, BrickLibrary, Side, virtio};
use net::{Mac, Vni};
use serde::Serialize;
use std::fs::File;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
#[allow(unused)]
use tracing::{debug, error, info, warn};

/// The virtual-network data-plane graph.
///
/// One instance owns the uplink, the VXLAN tunnel endpoint, all per-NIC
/// branches and the polling worker that runs them. All methods are meant to
/// be called from a single control thread; the façade serializes access.
pub struct Graph {
    lib: Arc<dyn BrickLibrary>,
    config: GraphConfig,
    queue: CommandQueue,
    receiver: Option<CommandReceiver>,
    poller: Option<Poller>,
    uplink: Option<BrickHandle>,
    vtep: Option<BrickHandle>,
    /// Main sniffer between uplink and tunnel endpoint, when tracing.
    sniffer: Option<BrickHandle>,
    is_vtep6: bool,
    vnis: VniTable,
    started: bool,
}

#[derive(Serialize)]
struct NicExport<'a> {
    id: &'a str,
    vni: u32,
    endpoint: String,
    packet_trace: bool,
    packet_trace_path: Option<&'a Path>,
}

impl Graph {
    #[must_use]
    pub fn new(lib: Arc<dyn BrickLibrary>, config: GraphConfig) -> Self {
        let (queue, receiver) = command_channel();
        Self {
            lib,
            config,
            queue,
            receiver: Some(receiver),
            poller: None,
            uplink: None,
            vtep: None,
            sniffer: None,
            is_vtep6: false,
            vnis: VniTable::new(),
            started: false,
        }
    }

    #[must_use]
    pub fn started(&self) -> bool {
        self.started
    }

    #[must_use]
    pub fn has_vni(&self, vni: Vni) -> bool {
        self.vnis.has_vni(vni)
    }

    /// Kernel tid of the polling worker, for cgroup classification.
    #[must_use]
    pub fn poller_tid(&self) -> Option<i32> {
        self.poller.as_ref().and_then(Poller::tid)
    }

    /// Fence: returns once the worker has executed every command enqueued
    /// before the call.
    pub fn sync(&self) {
        if self.started {
            self.queue.wait_empty();
        }
    }

    /// Bring the whole graph up: library, uplink (DPDK port with a tap
    /// fallback), offload negotiation, optional main sniffer, tunnel
    /// endpoint, and finally the polling worker.
    pub fn start(&mut self) -> Result<(), GraphError> {
        if self.started {
            return Err(GraphError::AlreadyStarted);
        }
        self.lib.init(&self.config.dpdk_args)?;
        self.queue.vhost_start();

        let (uplink, mac) = match self.config.dpdk_port {
            Some(port) => match self.lib.nic_new_by_port(&format!("port-{port}"), port) {
                Ok(nic) => {
                    debug!("using dpdk port {port}");
                    self.set_config_mtu(&nic);
                    let mac = self.lib.nic_get_mac(&nic);
                    (nic, mac)
                }
                Err(e) => {
                    warn!("no usable dpdk port {port}: {e}");
                    self.tap_uplink()?
                }
            },
            None => self.tap_uplink()?,
        };

        let caps = self.lib.nic_tx_capabilities(&uplink);
        if self.config.disable_offload || !caps.ipv4_cksum || !caps.tcp_tso {
            if self.config.disable_offload {
                info!("offloading manually deactivated");
            } else {
                info!("no offloading available on the uplink");
            }
            self.lib.vhost_disable_features(
                virtio::VIRTIO_NET_F_HOST_TSO4 | virtio::VIRTIO_NET_F_HOST_TSO6,
            );
        } else {
            info!("uplink offloading is available");
        }

        let sniffer = if self.config.packet_trace {
            let pid = std::process::id();
            let path = std::env::temp_dir()
                .join(format!("{}-{pid}-main.pcap", self.config.pcap_prefix));
            let file = File::create(&path)?;
            let brick = self
                .lib
                .print_new(&format!("main-sniffer-{pid}"), file)?;
            info!("tracing tunnel traffic into {}", path.display());
            Some(BrickHandle::new(brick, self.queue.clone(), self.lib.clone()))
        } else {
            None
        };

        let vtep = self
            .lib
            .vtep_new("vxlan", self.config.external_ip, mac)?;
        self.is_vtep6 = vtep.kind() == BrickKind::Vtep6;

        // The worker is not running yet, so these links are direct.
        match &sniffer {
            Some(sniffer) => self
                .lib
                .chained_links(&[&uplink, sniffer.brick(), &vtep])?,
            None => self.lib.link(&uplink, &vtep)?,
        }

        let receiver = match self.receiver.take() {
            Some(receiver) => receiver,
            None => {
                // the previous worker died with the receiver; start fresh
                let (queue, receiver) = command_channel();
                self.queue = queue;
                receiver
            }
        };
        self.poller = Some(Poller::spawn(
            self.lib.clone(),
            uplink.clone(),
            receiver,
            self.config.poller_core,
            self.config.socket_dir.clone(),
        )?);

        self.uplink = Some(BrickHandle::new(
            uplink,
            self.queue.clone(),
            self.lib.clone(),
        ));
        self.vtep = Some(BrickHandle::new(vtep, self.queue.clone(), self.lib.clone()));
        self.sniffer = sniffer;
        self.started = true;
        info!("graph started");
        Ok(())
    }

    /// Tear everything down: every branch through the worker, then the
    /// worker itself, then the remaining bricks directly.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        for (vni, id) in self.vnis.nic_keys() {
            if let Err(e) = self.remove_branch(vni, &id) {
                error!("failed to remove nic '{id}' from vni {vni}: {e}");
            }
        }
        self.queue.vhost_stop();
        self.queue.exit();
        if let Some(poller) = self.poller.take() {
            if let Some(receiver) = poller.join() {
                // commands behind the exit are dropped unexecuted
                while receiver.try_recv().is_some() {}
            }
        }
        // A fresh channel for a potential restart. The old sender halves are
        // now disconnected, so the remaining handles destroy their bricks
        // directly when dropped.
        let (queue, receiver) = command_channel();
        self.queue = queue;
        self.receiver = Some(receiver);
        self.sniffer = None;
        self.vtep = None;
        self.uplink = None;
        self.vnis.clear();
        self.lib.shutdown();
        self.started = false;
        info!("graph stopped");
    }

    /// Build the branch for `nic`, wire it into its VNI, refresh the
    /// pollables and install its firewall rules. Returns the guest-facing
    /// endpoint: the vhost-user socket path or the tap interface name.
    pub fn nic_add(&mut self, model: &Model, nic: &Nic) -> Result<String, GraphError> {
        if !self.started {
            error!("graph has not been started");
            return Err(GraphError::NotStarted);
        }
        let gn = build_branch(&self.lib, &self.queue, nic)?;
        let endpoint = gn.endpoint.brick().clone();

        let vtep = self.vtep_brick()?;
        let ctx = TopologyCtx {
            lib: &self.lib,
            queue: &self.queue,
            vtep: &vtep,
            is_vtep6: self.is_vtep6,
        };
        self.vnis.attach(&ctx, gn, nic.vni)?;
        self.update_poll();

        if let Err(e) = self.fw_update(model, nic) {
            error!("firewall update for nic '{}' failed: {e}", nic.id);
        }
        info!("nic '{}' attached to vni {}", nic.id, nic.vni);
        Ok(self.endpoint_path(&endpoint))
    }

    /// Detach and dismantle the branch of `nic`.
    pub fn nic_del(&mut self, nic: &Nic) -> Result<(), GraphError> {
        if !self.started {
            error!("graph has not been started");
            return Err(GraphError::NotStarted);
        }
        self.remove_branch(nic.vni, &nic.id)?;
        info!("nic '{}' detached from vni {}", nic.id, nic.vni);
        Ok(())
    }

    /// Byte counters of the guest-facing endpoint; (0, 0) for an unknown
    /// NIC. Reads the brick counters directly, which the library guarantees
    /// to be atomic with respect to polling.
    #[must_use]
    pub fn nic_get_stats(&self, nic: &Nic) -> (u64, u64) {
        match self.vnis.nic(nic.vni, &nic.id) {
            Some(gn) => (
                self.lib.rx_bytes(gn.endpoint.brick()),
                self.lib.tx_bytes(gn.endpoint.brick()),
            ),
            None => (0, 0),
        }
    }

    /// Re-program ARP anti-spoofing from the NIC's current address list, or
    /// disable it.
    pub fn nic_config_antispoof(&mut self, nic: &Nic, enable: bool) -> Result<(), GraphError> {
        let antispoof = self.find_nic(nic)?.antispoof.brick().clone();
        if enable {
            self.lib.antispoof_arp_del_all(&antispoof);
            for ip in &nic.ip_list {
                if let IpAddr::V4(ip) = ip {
                    if let Err(e) = self.lib.antispoof_arp_add(&antispoof, *ip) {
                        error!("cannot allow arp for {ip} on nic '{}': {e}", nic.id);
                    }
                }
            }
            self.lib.antispoof_arp_enable(&antispoof);
        } else {
            self.lib.antispoof_arp_disable(&antispoof);
        }
        Ok(())
    }

    /// Splice a sniffer into the branch of `nic` or take it back out. The
    /// branch itself knows whether a capture is live; asking for the
    /// current state is a no-op.
    pub fn nic_config_packet_trace(
        &mut self,
        nic: &Nic,
        enable: bool,
    ) -> Result<(), GraphError> {
        if !self.started {
            error!("graph has not been started");
            return Err(GraphError::NotStarted);
        }
        let vtep = self.vtep_brick()?;
        let upstream = self.vnis.upstream(nic.vni, &vtep);
        let Some(gn) = self.vnis.nic_mut(nic.vni, &nic.id) else {
            error!("nic '{}' in vni {} does not exist", nic.id, nic.vni);
            return Err(GraphError::NoSuchNic {
                id: nic.id.clone(),
                vni: nic.vni.as_u32(),
            });
        };
        if gn.trace_active == enable {
            info!(
                "packet trace on '{}' is already {}",
                nic.id,
                if enable { "enabled" } else { "disabled" }
            );
            return Ok(());
        }
        let ctx = TopologyCtx {
            lib: &self.lib,
            queue: &self.queue,
            vtep: &vtep,
            is_vtep6: self.is_vtep6,
        };
        if enable {
            let sniffer = match gn.sniffer.clone() {
                Some(sniffer) => sniffer,
                None => {
                    let Some(path) = &nic.packet_trace_path else {
                        return Err(GraphError::MissingTracePath(nic.id.clone()));
                    };
                    gn.trace_path = Some(path.clone());
                    new_sniffer(&self.lib, &self.queue, &nic.id, path)?
                }
            };
            splice_sniffer(gn, nic.bypass_filtering, &ctx, &upstream, nic.vni, sniffer);
        } else {
            unsplice_sniffer(gn, nic.bypass_filtering, &ctx, &upstream, nic.vni)?;
        }
        self.update_poll();
        Ok(())
    }

    /// Redirect the capture of `nic` into a new file. Setting the path it
    /// already captures to is a no-op.
    pub fn nic_config_packet_trace_path(
        &mut self,
        nic: &Nic,
        path: &Path,
    ) -> Result<(), GraphError> {
        if !self.started {
            error!("graph has not been started");
            return Err(GraphError::NotStarted);
        }
        let vtep = self.vtep_brick()?;
        let upstream = self.vnis.upstream(nic.vni, &vtep);
        let Some(gn) = self.vnis.nic_mut(nic.vni, &nic.id) else {
            error!("nic '{}' in vni {} does not exist", nic.id, nic.vni);
            return Err(GraphError::NoSuchNic {
                id: nic.id.clone(),
                vni: nic.vni.as_u32(),
            });
        };
        if gn.trace_path.as_deref() == Some(path) {
            info!(
                "packet trace of '{}' already goes to {}",
                nic.id,
                path.display()
            );
            return Ok(());
        }
        if gn.trace_active {
            let ctx = TopologyCtx {
                lib: &self.lib,
                queue: &self.queue,
                vtep: &vtep,
                is_vtep6: self.is_vtep6,
            };
            unsplice_sniffer(gn, nic.bypass_filtering, &ctx, &upstream, nic.vni)?;
            // last handle of the old sniffer: queues its destruction and
            // thereby closes the old file
            gn.sniffer = None;
            let sniffer = new_sniffer(&self.lib, &self.queue, &nic.id, path)?;
            splice_sniffer(gn, nic.bypass_filtering, &ctx, &upstream, nic.vni, sniffer);
            gn.trace_path = Some(path.to_path_buf());
            self.update_poll();
        } else {
            // no live capture; remember the path and let the next enable
            // open the new file
            gn.sniffer = None;
            gn.trace_path = Some(path.to_path_buf());
        }
        Ok(())
    }

    /// Recompile and install both rule streams of the branch firewall.
    pub fn fw_update(&mut self, model: &Model, nic: &Nic) -> Result<(), GraphError> {
        if !self.started {
            error!("graph has not been started");
            return Err(GraphError::NotStarted);
        }
        if nic.bypass_filtering {
            warn!(
                "'{}': firewall update skipped, filtering is bypassed",
                nic.id
            );
            return Ok(());
        }
        let firewall = self.find_nic(nic)?.firewall.brick().clone();

        let inbound = rules::inbound_filter(nic, model);
        let outbound = rules::outbound_filter(nic);
        debug!("rules (in) for nic '{}': {inbound}", nic.id);
        debug!("rules (out) for nic '{}': {outbound}", nic.id);

        // Rule staging happens here on the control thread; only the reload,
        // which publishes to the datapath, goes through the worker.
        self.lib.firewall_rule_flush(&firewall);
        if !inbound.is_empty() {
            if let Err(e) = self
                .lib
                .firewall_rule_add(&firewall, &inbound, Side::West, 0)
            {
                error!("cannot install inbound rules for nic '{}': {e}", nic.id);
                return Err(e.into());
            }
        }
        if !outbound.is_empty() {
            if let Err(e) = self
                .lib
                .firewall_rule_add(&firewall, &outbound, Side::East, 1)
            {
                error!("cannot install outbound rules for nic '{}': {e}", nic.id);
                return Err(e.into());
            }
        }
        self.queue.fw_reload(firewall);
        Ok(())
    }

    /// Stage one additional inbound rule on the branch firewall and reload.
    pub fn fw_add_rule(
        &mut self,
        model: &Model,
        nic: &Nic,
        rule: &Rule,
    ) -> Result<(), GraphError> {
        if !self.started {
            error!("graph has not been started");
            return Err(GraphError::NotStarted);
        }
        if nic.bypass_filtering {
            warn!("'{}': rule skipped, filtering is bypassed", nic.id);
            return Ok(());
        }
        let Some(text) = rules::compile_rule(rule, model) else {
            error!("cannot build the rule to add for nic '{}'", nic.id);
            return Err(GraphError::EmptyRule(nic.id.clone()));
        };
        let firewall = self.find_nic(nic)?.firewall.brick().clone();
        debug!("adding rule to firewall of nic '{}': {text}", nic.id);
        if let Err(e) = self.lib.firewall_rule_add(&firewall, &text, Side::West, 0) {
            error!("cannot stage rule for nic '{}': {e}", nic.id);
            return Err(e.into());
        }
        self.queue.fw_reload(firewall);
        Ok(())
    }

    /// DOT serialization of the graph, from the uplink root.
    #[must_use]
    pub fn dot(&self) -> String {
        match &self.uplink {
            Some(uplink) => self.lib.dot(uplink.brick()),
            None => String::new(),
        }
    }

    /// JSON description of a branch: id, vni, endpoint path, trace state.
    pub fn nic_export(&self, nic: &Nic) -> Result<String, GraphError> {
        if !self.started {
            error!("graph has not been started");
            return Err(GraphError::NotStarted);
        }
        let gn = self.find_nic(nic)?;
        let export = NicExport {
            id: &gn.id,
            vni: nic.vni.as_u32(),
            endpoint: self.endpoint_path(gn.endpoint.brick()),
            packet_trace: gn.trace_active,
            packet_trace_path: gn.trace_path.as_deref(),
        };
        Ok(serde_json::to_string(&export)?)
    }

    fn tap_uplink(&self) -> Result<(Brick, Mac), GraphError> {
        let tap = self.lib.tap_new("tap", None).map_err(|e| {
            error!("cannot create tap uplink: {e}");
            e
        })?;
        let mac = self.lib.tap_get_mac(&tap).map_err(|e| {
            error!("cannot get mac of tap uplink: {e}");
            e
        })?;
        info!("created tap interface {} ({mac})", self.lib.tap_ifname(&tap));
        Ok((tap, mac))
    }

    fn set_config_mtu(&self, nic: &Brick) {
        match self.config.nic_mtu {
            None => {}
            Some(MtuRequest::Max) => {
                info!("probing for the maximal uplink MTU");
                let mut low = 1400u32;
                let mut high = 65536u32;
                while low != high - 1 {
                    let mid = (low + high) / 2;
                    if self.lib.nic_set_mtu(nic, mid).is_ok() {
                        low = mid;
                    } else {
                        high = mid;
                    }
                }
                match self.lib.nic_set_mtu(nic, low) {
                    Ok(()) => info!("found maximal MTU of {low}"),
                    Err(e) => error!("failed to install the probed MTU {low}: {e}"),
                }
            }
            Some(MtuRequest::Fixed(mtu)) => match self.lib.nic_set_mtu(nic, mtu) {
                Ok(()) => info!("MTU set to {mtu}"),
                Err(e) => error!("cannot set MTU to {mtu}: {e}"),
            },
        }
        match self.lib.nic_get_mtu(nic) {
            Ok(mtu) => debug!("uplink MTU is {mtu}"),
            Err(e) => debug!("cannot read the uplink MTU: {e}"),
        }
    }

    /// Disable a branch, withdraw it from polling, then detach it.
    fn remove_branch(&mut self, vni: Vni, id: &str) -> Result<(), GraphError> {
        let Some(gn) = self.vnis.nic_mut(vni, id) else {
            error!("nic '{id}' in vni {vni} does not exist");
            return Err(GraphError::NoSuchNic {
                id: id.to_string(),
                vni: vni.as_u32(),
            });
        };
        gn.enable = false;
        self.update_poll();

        let vtep = self.vtep_brick()?;
        let ctx = TopologyCtx {
            lib: &self.lib,
            queue: &self.queue,
            vtep: &vtep,
            is_vtep6: self.is_vtep6,
        };
        self.vnis.detach(&ctx, vni, id)
    }

    fn update_poll(&self) {
        let snapshot = PollSnapshot::from_pairs(self.vnis.poll_pairs().into_iter());
        self.queue.update_poll(snapshot);
    }

    fn endpoint_path(&self, endpoint: &Brick) -> String {
        match endpoint.kind() {
            BrickKind::Vhost => self.lib.vhost_socket_path(endpoint),
            _ => self.lib.tap_ifname(endpoint),
        }
    }

    fn vtep_brick(&self) -> Result<Brick, GraphError> {
        self.vtep
            .as_ref()
            .map(|handle| handle.brick().clone())
            .ok_or(GraphError::NotStarted)
    }

    fn find_nic(&self, nic: &Nic) -> Result<&GraphNic, GraphError> {
        self.vnis.nic(nic.vni, &nic.id).ok_or_else(|| {
            error!("nic '{}' in vni {} does not exist", nic.id, nic.vni);
            GraphError::NoSuchNic {
                id: nic.id.clone(),
                vni: nic.vni.as_u32(),
            }
        })
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        self.stop();
    }
}
