// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-memory brick library for tests.
//!
//! [`TestLibrary`] implements [`BrickLibrary`] without any datapath: it keeps
//! a live edge table, per-firewall rule stores, per-brick counters, and an
//! ordered log of every mutating call. Controller tests drain the log with
//! [`TestLibrary::take_ops`] and assert on the sequence the polling worker
//! actually executed. Polls and garbage-collection rounds are counted rather
//! than logged so the hot loop does not flood the log.

use crate::{Brick, BrickError, BrickKind, BrickLibrary, FirewallFlags, Side, TxCapabilities};
use net::{Mac, Vni};
use std::collections::HashMap;
use std::fs::File;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::debug;

/// One mutating call, by brick name, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Init,
    Shutdown,
    VhostStart(PathBuf),
    VhostStop,
    New { name: String, kind: BrickKind },
    Link { west: String, east: String },
    Unlink { brick: String },
    UnlinkEdge { west: String, east: String },
    AddVni { vtep: String, neighbor: String, vni: u32, mcast: IpAddr },
    RuleAdd { firewall: String, expr: String, side: Side, priority: u32 },
    RuleFlush { firewall: String },
    FwReload { firewall: String },
    Destroy { brick: String },
    ArpAdd { antispoof: String, ip: Ipv4Addr },
    ArpDelAll { antispoof: String },
    ArpEnable { antispoof: String },
    ArpDisable { antispoof: String },
    SetMtu(u32),
    DisableFeatures(u64),
}

type RuleEntry = (Side, u32, String);

#[derive(Default)]
struct State {
    initialized: bool,
    vhost_running: bool,
    socket_dir: Option<PathBuf>,
    ops: Vec<Op>,
    bricks: Vec<Brick>,
    links: Vec<(Brick, Brick)>,
    destroyed: Vec<Brick>,
    files: HashMap<Brick, File>,
    ifnames: HashMap<Brick, String>,
    staged: HashMap<Brick, Vec<RuleEntry>>,
    loaded: HashMap<Brick, Vec<RuleEntry>>,
    arp_allowed: HashMap<Brick, Vec<Ipv4Addr>>,
    arp_enabled: HashMap<Brick, bool>,
    vnis: Vec<(Brick, Brick, Vni, IpAddr)>,
    counters: HashMap<Brick, (u64, u64)>,
    poll_counts: HashMap<Brick, u64>,
    gc_counts: HashMap<Brick, u64>,
    disabled_features: u64,
    mtu: u32,
}

/// A [`BrickLibrary`] double with call recording and failure injection.
pub struct TestLibrary {
    state: Mutex<State>,
    fail_nic_port: AtomicBool,
    // 0 means unlimited
    mtu_limit: AtomicU32,
    tx_caps: Mutex<TxCapabilities>,
}

impl Default for TestLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl TestLibrary {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                mtu: 1500,
                ..State::default()
            }),
            fail_nic_port: AtomicBool::new(false),
            mtu_limit: AtomicU32::new(0),
            tx_caps: Mutex::new(TxCapabilities {
                ipv4_cksum: true,
                tcp_tso: true,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn create(&self, name: &str, kind: BrickKind) -> Brick {
        let brick = Brick::new(name, kind);
        let mut state = self.lock();
        state.bricks.push(brick.clone());
        state.ops.push(Op::New {
            name: name.to_string(),
            kind,
        });
        brick
    }

    /// Make `nic_new_by_port` fail so callers exercise their tap fallback.
    pub fn fail_nic_port(&self, fail: bool) {
        self.fail_nic_port.store(fail, Ordering::Relaxed);
    }

    /// Accept `nic_set_mtu` only up to `limit`.
    pub fn set_mtu_limit(&self, limit: u32) {
        self.mtu_limit.store(limit, Ordering::Relaxed);
    }

    pub fn set_tx_capabilities(&self, caps: TxCapabilities) {
        let mut guard = self
            .tx_caps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = caps;
    }

    /// Prime the rx/tx byte counters of a brick.
    pub fn set_counters(&self, brick: &Brick, rx: u64, tx: u64) {
        self.lock().counters.insert(brick.clone(), (rx, tx));
    }

    /// Drain the mutation log.
    #[must_use]
    pub fn take_ops(&self) -> Vec<Op> {
        std::mem::take(&mut self.lock().ops)
    }

    /// Current live edges as (west, east) name pairs.
    #[must_use]
    pub fn edges(&self) -> Vec<(String, String)> {
        self.lock()
            .links
            .iter()
            .map(|(w, e)| (w.name().to_string(), e.name().to_string()))
            .collect()
    }

    #[must_use]
    pub fn has_edge(&self, west: &str, east: &str) -> bool {
        self.lock()
            .links
            .iter()
            .any(|(w, e)| w.name() == west && e.name() == east)
    }

    #[must_use]
    pub fn is_destroyed(&self, name: &str) -> bool {
        self.lock().destroyed.iter().any(|b| b.name() == name)
    }

    /// The most recently created live brick with this name.
    #[must_use]
    pub fn brick_by_name(&self, name: &str) -> Option<Brick> {
        let state = self.lock();
        state
            .bricks
            .iter()
            .rev()
            .find(|b| b.name() == name && !state.destroyed.contains(*b))
            .cloned()
    }

    /// Rules published by the last `firewall_reload`.
    #[must_use]
    pub fn loaded_rules(&self, firewall: &Brick) -> Vec<(Side, u32, String)> {
        self.lock().loaded.get(firewall).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn poll_count(&self, brick: &Brick) -> u64 {
        self.lock().poll_counts.get(brick).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn gc_count(&self, firewall: &Brick) -> u64 {
        self.lock().gc_counts.get(firewall).copied().unwrap_or(0)
    }

    /// All `vtep_add_vni` registrations as (vtep, neighbor, vni, group).
    #[must_use]
    pub fn vni_registrations(&self) -> Vec<(String, String, u32, IpAddr)> {
        self.lock()
            .vnis
            .iter()
            .map(|(v, n, vni, ip)| {
                (v.name().to_string(), n.name().to_string(), vni.as_u32(), *ip)
            })
            .collect()
    }

    /// Allowed ARP addresses and enablement of an antispoof brick.
    #[must_use]
    pub fn arp_state(&self, antispoof: &Brick) -> (Vec<Ipv4Addr>, bool) {
        let state = self.lock();
        (
            state.arp_allowed.get(antispoof).cloned().unwrap_or_default(),
            state.arp_enabled.get(antispoof).copied().unwrap_or(false),
        )
    }

    #[must_use]
    pub fn disabled_features(&self) -> u64 {
        self.lock().disabled_features
    }

    #[must_use]
    pub fn vhost_running(&self) -> bool {
        self.lock().vhost_running
    }

    /// True while a pcap file is held open by a live print brick.
    #[must_use]
    pub fn open_pcap_count(&self) -> usize {
        self.lock().files.len()
    }
}

impl BrickLibrary for TestLibrary {
    fn init(&self, _args: &[String]) -> Result<(), BrickError> {
        let mut state = self.lock();
        state.initialized = true;
        state.ops.push(Op::Init);
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.lock();
        state.initialized = false;
        state.ops.push(Op::Shutdown);
    }

    fn vhost_start(&self, socket_dir: &Path) -> Result<(), BrickError> {
        let mut state = self.lock();
        state.vhost_running = true;
        state.socket_dir = Some(socket_dir.to_path_buf());
        state.ops.push(Op::VhostStart(socket_dir.to_path_buf()));
        Ok(())
    }

    fn vhost_stop(&self) {
        let mut state = self.lock();
        state.vhost_running = false;
        state.ops.push(Op::VhostStop);
    }

    fn vhost_disable_features(&self, features: u64) {
        let mut state = self.lock();
        state.disabled_features |= features;
        state.ops.push(Op::DisableFeatures(features));
    }

    fn nic_new_by_port(&self, name: &str, port: u16) -> Result<Brick, BrickError> {
        if self.fail_nic_port.load(Ordering::Relaxed) {
            return Err(BrickError::CreationFailed {
                name: name.to_string(),
                reason: format!("no device on port {port}"),
            });
        }
        Ok(self.create(name, BrickKind::Nic))
    }

    fn tap_new(&self, name: &str, ifname: Option<&str>) -> Result<Brick, BrickError> {
        let brick = self.create(name, BrickKind::Tap);
        let ifname = ifname.unwrap_or(name).to_string();
        self.lock().ifnames.insert(brick.clone(), ifname);
        Ok(brick)
    }

    fn vhost_new(&self, name: &str) -> Result<Brick, BrickError> {
        Ok(self.create(name, BrickKind::Vhost))
    }

    fn vtep_new(&self, name: &str, local_ip: IpAddr, _mac: Mac) -> Result<Brick, BrickError> {
        let kind = match local_ip {
            IpAddr::V4(_) => BrickKind::Vtep4,
            IpAddr::V6(_) => BrickKind::Vtep6,
        };
        Ok(self.create(name, kind))
    }

    fn switch_new(
        &self,
        name: &str,
        _west_max: u32,
        _east_max: u32,
        _side: Side,
    ) -> Result<Brick, BrickError> {
        Ok(self.create(name, BrickKind::Switch))
    }

    fn firewall_new(
        &self,
        name: &str,
        _west_max: u32,
        _east_max: u32,
        _flags: FirewallFlags,
    ) -> Result<Brick, BrickError> {
        Ok(self.create(name, BrickKind::Firewall))
    }

    fn antispoof_new(&self, name: &str, _side: Side, _mac: Mac) -> Result<Brick, BrickError> {
        Ok(self.create(name, BrickKind::Antispoof))
    }

    fn print_new(&self, name: &str, output: File) -> Result<Brick, BrickError> {
        let brick = self.create(name, BrickKind::Print);
        self.lock().files.insert(brick.clone(), output);
        Ok(brick)
    }

    fn link(&self, west: &Brick, east: &Brick) -> Result<(), BrickError> {
        let mut state = self.lock();
        state.links.push((west.clone(), east.clone()));
        state.ops.push(Op::Link {
            west: west.name().to_string(),
            east: east.name().to_string(),
        });
        Ok(())
    }

    fn unlink(&self, brick: &Brick) -> Result<(), BrickError> {
        let mut state = self.lock();
        state.links.retain(|(w, e)| w != brick && e != brick);
        state.ops.push(Op::Unlink {
            brick: brick.name().to_string(),
        });
        Ok(())
    }

    fn unlink_edge(&self, west: &Brick, east: &Brick) -> Result<(), BrickError> {
        let mut state = self.lock();
        let before = state.links.len();
        state.links.retain(|(w, e)| !(w == west && e == east));
        if state.links.len() == before {
            return Err(BrickError::NoSuchEdge {
                west: west.name().to_string(),
                east: east.name().to_string(),
            });
        }
        state.ops.push(Op::UnlinkEdge {
            west: west.name().to_string(),
            east: east.name().to_string(),
        });
        Ok(())
    }

    fn brick_destroy(&self, brick: &Brick) {
        let mut state = self.lock();
        state.links.retain(|(w, e)| w != brick && e != brick);
        // closes the pcap file, if any
        state.files.remove(brick);
        state.destroyed.push(brick.clone());
        state.ops.push(Op::Destroy {
            brick: brick.name().to_string(),
        });
        debug!("destroyed brick {brick}");
    }

    fn poll(&self, brick: &Brick) -> Result<u16, BrickError> {
        *self.lock().poll_counts.entry(brick.clone()).or_insert(0) += 1;
        Ok(0)
    }

    fn firewall_gc(&self, firewall: &Brick) {
        *self.lock().gc_counts.entry(firewall.clone()).or_insert(0) += 1;
    }

    fn firewall_rule_add(
        &self,
        firewall: &Brick,
        expr: &str,
        side: Side,
        priority: u32,
    ) -> Result<(), BrickError> {
        let mut state = self.lock();
        state
            .staged
            .entry(firewall.clone())
            .or_default()
            .push((side, priority, expr.to_string()));
        state.ops.push(Op::RuleAdd {
            firewall: firewall.name().to_string(),
            expr: expr.to_string(),
            side,
            priority,
        });
        Ok(())
    }

    fn firewall_rule_flush(&self, firewall: &Brick) {
        let mut state = self.lock();
        state.staged.remove(firewall);
        state.ops.push(Op::RuleFlush {
            firewall: firewall.name().to_string(),
        });
    }

    fn firewall_reload(&self, firewall: &Brick) -> Result<(), BrickError> {
        let mut state = self.lock();
        let staged = state.staged.get(firewall).cloned().unwrap_or_default();
        state.loaded.insert(firewall.clone(), staged);
        state.ops.push(Op::FwReload {
            firewall: firewall.name().to_string(),
        });
        Ok(())
    }

    fn vtep_add_vni(
        &self,
        vtep: &Brick,
        neighbor: &Brick,
        vni: Vni,
        mcast_group: IpAddr,
    ) -> Result<(), BrickError> {
        let mut state = self.lock();
        state
            .vnis
            .push((vtep.clone(), neighbor.clone(), vni, mcast_group));
        state.ops.push(Op::AddVni {
            vtep: vtep.name().to_string(),
            neighbor: neighbor.name().to_string(),
            vni: vni.as_u32(),
            mcast: mcast_group,
        });
        Ok(())
    }

    fn antispoof_arp_add(&self, antispoof: &Brick, ip: Ipv4Addr) -> Result<(), BrickError> {
        let mut state = self.lock();
        state
            .arp_allowed
            .entry(antispoof.clone())
            .or_default()
            .push(ip);
        state.ops.push(Op::ArpAdd {
            antispoof: antispoof.name().to_string(),
            ip,
        });
        Ok(())
    }

    fn antispoof_arp_del_all(&self, antispoof: &Brick) {
        let mut state = self.lock();
        state.arp_allowed.remove(antispoof);
        state.ops.push(Op::ArpDelAll {
            antispoof: antispoof.name().to_string(),
        });
    }

    fn antispoof_arp_enable(&self, antispoof: &Brick) {
        let mut state = self.lock();
        state.arp_enabled.insert(antispoof.clone(), true);
        state.ops.push(Op::ArpEnable {
            antispoof: antispoof.name().to_string(),
        });
    }

    fn antispoof_arp_disable(&self, antispoof: &Brick) {
        let mut state = self.lock();
        state.arp_enabled.insert(antispoof.clone(), false);
        state.ops.push(Op::ArpDisable {
            antispoof: antispoof.name().to_string(),
        });
    }

    fn nic_get_mac(&self, _nic: &Brick) -> Mac {
        Mac([0x52, 0x54, 0x00, 0x00, 0x00, 0x01])
    }

    fn nic_set_mtu(&self, _nic: &Brick, mtu: u32) -> Result<(), BrickError> {
        let limit = self.mtu_limit.load(Ordering::Relaxed);
        if limit != 0 && mtu > limit {
            return Err(BrickError::InvalidOperation {
                brick: "nic".to_string(),
                reason: format!("mtu {mtu} above device limit {limit}"),
            });
        }
        let mut state = self.lock();
        state.mtu = mtu;
        state.ops.push(Op::SetMtu(mtu));
        Ok(())
    }

    fn nic_get_mtu(&self, _nic: &Brick) -> Result<u16, BrickError> {
        let mtu = self.lock().mtu;
        u16::try_from(mtu).map_err(|_| BrickError::InvalidOperation {
            brick: "nic".to_string(),
            reason: format!("mtu {mtu} out of range"),
        })
    }

    fn nic_tx_capabilities(&self, _nic: &Brick) -> TxCapabilities {
        *self
            .tx_caps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn vhost_socket_path(&self, vhost: &Brick) -> String {
        let state = self.lock();
        let dir = state
            .socket_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        dir.join(format!("{}.sock", vhost.name()))
            .to_string_lossy()
            .into_owned()
    }

    fn tap_ifname(&self, tap: &Brick) -> String {
        self.lock()
            .ifnames
            .get(tap)
            .cloned()
            .unwrap_or_else(|| tap.name().to_string())
    }

    fn tap_get_mac(&self, _tap: &Brick) -> Result<Mac, BrickError> {
        Ok(Mac([0x52, 0x54, 0x00, 0x74, 0x61, 0x70]))
    }

    fn rx_bytes(&self, brick: &Brick) -> u64 {
        self.lock().counters.get(brick).map_or(0, |c| c.0)
    }

    fn tx_bytes(&self, brick: &Brick) -> u64 {
        self.lock().counters.get(brick).map_or(0, |c| c.1)
    }

    fn dot(&self, root: &Brick) -> String {
        let state = self.lock();
        // edges of the connected component of root, in discovery order
        let mut component = vec![root.clone()];
        let mut edges: Vec<(String, String)> = Vec::new();
        let mut cursor = 0;
        while cursor < component.len() {
            let brick = component[cursor].clone();
            cursor += 1;
            for (w, e) in &state.links {
                if w == &brick && !component.contains(e) {
                    component.push(e.clone());
                }
                if e == &brick && !component.contains(w) {
                    component.push(w.clone());
                }
                if (w == &brick || e == &brick)
                    && !edges.contains(&(w.name().to_string(), e.name().to_string()))
                {
                    edges.push((w.name().to_string(), e.name().to_string()));
                }
            }
        }
        let mut out = String::from("graph {\n");
        for (w, e) in edges {
            out.push_str(&format!("  \"{w}\" -- \"{e}\";\n"));
        }
        out.push('}');
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn unlink_removes_all_edges() {
        let lib = TestLibrary::new();
        lib.init(&[]).unwrap();
        let a = lib.vhost_new("a").unwrap();
        let b = lib.vhost_new("b").unwrap();
        let c = lib.vhost_new("c").unwrap();
        lib.link(&a, &b).unwrap();
        lib.link(&b, &c).unwrap();
        lib.unlink(&b).unwrap();
        assert!(lib.edges().is_empty());
    }

    #[test]
    fn unlink_edge_is_selective() {
        let lib = TestLibrary::new();
        lib.init(&[]).unwrap();
        let a = lib.vhost_new("a").unwrap();
        let b = lib.vhost_new("b").unwrap();
        let c = lib.vhost_new("c").unwrap();
        lib.link(&a, &b).unwrap();
        lib.link(&a, &c).unwrap();
        lib.unlink_edge(&a, &b).unwrap();
        assert!(!lib.has_edge("a", "b"));
        assert!(lib.has_edge("a", "c"));
        assert!(lib.unlink_edge(&a, &b).is_err());
    }

    #[test]
    fn reload_publishes_staged_rules() {
        let lib = TestLibrary::new();
        lib.init(&[]).unwrap();
        let fw = lib
            .firewall_new("fw", 1, 1, FirewallFlags::NO_CONN_WORKER)
            .unwrap();
        lib.firewall_rule_add(&fw, "ip", Side::West, 0).unwrap();
        assert!(lib.loaded_rules(&fw).is_empty());
        lib.firewall_reload(&fw).unwrap();
        assert_eq!(lib.loaded_rules(&fw), vec![(Side::West, 0, "ip".to_string())]);
    }

    #[test]
    fn dot_walks_the_component() {
        let lib = TestLibrary::new();
        lib.init(&[]).unwrap();
        let a = lib.vhost_new("a").unwrap();
        let b = lib.vhost_new("b").unwrap();
        let unrelated = lib.vhost_new("x").unwrap();
        let y = lib.vhost_new("y").unwrap();
        lib.link(&a, &b).unwrap();
        lib.link(&unrelated, &y).unwrap();
        let dot = lib.dot(&a);
        assert!(dot.contains("\"a\" -- \"b\""));
        assert!(!dot.contains('x'));
    }
}
