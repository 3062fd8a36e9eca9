// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-VNI topology.
//!
//! Every VNI owns the set of NIC branches attached to it. A single branch
//! hangs directly off the tunnel endpoint; from two branches on, a switch
//! sits between the endpoint and all branch heads. Attach and detach keep
//! the invariant that a switch exists iff the VNI has at least two branches
//! at every quiescent point.

use crate::command::CommandQueue;
use crate::errors::GraphError;
use crate::handle::BrickHandle;
use ahash::RandomState;
use brick::{Brick, BrickLibrary, Side};
use net::Vni;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
#[allow(unused)]
use tracing::{debug, error, info};

/// One NIC branch: the chain of bricks from the tunnel-facing head down to
/// the guest-facing endpoint.
pub(crate) struct GraphNic {
    pub id: String,
    /// While false the branch is left out of the pollables snapshot.
    pub enable: bool,
    /// Manual handle: the firewall is destroyed by an explicit queue
    /// command during detach, not by dropping the branch.
    pub firewall: BrickHandle,
    pub antispoof: BrickHandle,
    pub sniffer: Option<BrickHandle>,
    /// The vhost or tap brick terminating the branch.
    pub endpoint: BrickHandle,
    /// Upstream entry point of the branch; the brick linked to the tunnel
    /// endpoint or switch.
    pub head: Brick,
    /// Whether the sniffer is currently spliced into the chain.
    pub trace_active: bool,
    pub trace_path: Option<PathBuf>,
}

pub(crate) struct GraphVni {
    pub vni: Vni,
    pub switch: Option<BrickHandle>,
    pub nics: HashMap<String, GraphNic, RandomState>,
}

/// Shared context for topology mutations.
pub(crate) struct TopologyCtx<'a> {
    pub lib: &'a Arc<dyn BrickLibrary>,
    pub queue: &'a CommandQueue,
    pub vtep: &'a Brick,
    pub is_vtep6: bool,
}

impl TopologyCtx<'_> {
    fn mcast(&self, vni: Vni) -> IpAddr {
        if self.is_vtep6 {
            IpAddr::V6(vni.multicast_group_v6())
        } else {
            IpAddr::V4(vni.multicast_group_v4())
        }
    }

    /// Register `neighbor` as the graph-side peer of `vni` on the tunnel
    /// endpoint, with the multicast group derived from the VNI.
    pub(crate) fn register_vni(&self, neighbor: &Brick, vni: Vni) {
        self.queue
            .add_vni(self.vtep.clone(), neighbor.clone(), vni, self.mcast(vni));
    }
}

/// All VNIs and their branches.
#[derive(Default)]
pub(crate) struct VniTable {
    vnis: HashMap<Vni, GraphVni, RandomState>,
}

impl VniTable {
    pub(crate) fn new() -> Self {
        Self {
            vnis: HashMap::with_hasher(RandomState::with_seed(0)),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.vnis.is_empty()
    }

    pub(crate) fn has_vni(&self, vni: Vni) -> bool {
        self.vnis.contains_key(&vni)
    }

    pub(crate) fn nic(&self, vni: Vni, id: &str) -> Option<&GraphNic> {
        self.vnis.get(&vni).and_then(|gvni| gvni.nics.get(id))
    }

    pub(crate) fn nic_mut(&mut self, vni: Vni, id: &str) -> Option<&mut GraphNic> {
        self.vnis.get_mut(&vni).and_then(|gvni| gvni.nics.get_mut(id))
    }

    /// The brick a branch head of this VNI links to: the switch when one is
    /// inserted, the tunnel endpoint otherwise.
    pub(crate) fn upstream(&self, vni: Vni, vtep: &Brick) -> Brick {
        self.vnis
            .get(&vni)
            .and_then(|gvni| gvni.switch.as_ref())
            .map_or_else(|| vtep.clone(), |sw| sw.brick().clone())
    }

    /// Every (vni, nic id) pair currently attached.
    pub(crate) fn nic_keys(&self) -> Vec<(Vni, String)> {
        self.vnis
            .values()
            .flat_map(|gvni| gvni.nics.keys().map(|id| (gvni.vni, id.clone())))
            .collect()
    }

    /// The (pollable, firewall) pairs of all enabled branches.
    pub(crate) fn poll_pairs(&self) -> Vec<(Brick, Brick)> {
        self.vnis
            .values()
            .flat_map(|gvni| gvni.nics.values())
            .filter(|nic| nic.enable)
            .map(|nic| {
                (
                    nic.endpoint.brick().clone(),
                    nic.firewall.brick().clone(),
                )
            })
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.vnis.clear();
    }

    /// Insert a freshly built branch into its VNI and wire its head into
    /// the graph.
    pub(crate) fn attach(
        &mut self,
        ctx: &TopologyCtx<'_>,
        gn: GraphNic,
        vni: Vni,
    ) -> Result<(), GraphError> {
        let gvni = self.vnis.entry(vni).or_insert_with(|| GraphVni {
            vni,
            switch: None,
            nics: HashMap::with_hasher(RandomState::with_seed(0)),
        });

        match gvni.nics.len() {
            0 => {
                // single branch: direct link to the tunnel endpoint
                ctx.queue.link(ctx.vtep.clone(), gn.head.clone());
                ctx.register_vni(&gn.head, vni);
            }
            1 => {
                // second branch: insert a switch between endpoint and heads
                let name = format!("switch-{vni}");
                let switch = BrickHandle::new(
                    ctx.lib.switch_new(&name, 1, 30, Side::East)?,
                    ctx.queue.clone(),
                    ctx.lib.clone(),
                );
                let Some(first_head) =
                    gvni.nics.values().next().map(|nic| nic.head.clone())
                else {
                    return Err(GraphError::SwitchInvariant { vni: vni.as_u32() });
                };
                ctx.queue.unlink_edge(ctx.vtep.clone(), first_head.clone());
                ctx.queue.link(ctx.vtep.clone(), switch.brick().clone());
                ctx.register_vni(switch.brick(), vni);
                ctx.queue.link(switch.brick().clone(), first_head);
                ctx.queue.link(switch.brick().clone(), gn.head.clone());
                gvni.switch = Some(switch);
                info!("inserted {name} for vni {vni}");
            }
            _ => {
                let Some(switch) = &gvni.switch else {
                    error!("vni {vni} has several branches but no switch");
                    return Err(GraphError::SwitchInvariant { vni: vni.as_u32() });
                };
                ctx.queue.link(switch.brick().clone(), gn.head.clone());
            }
        }

        debug!("attached nic '{}' to vni {vni}", gn.id);
        gvni.nics.insert(gn.id.clone(), gn);
        Ok(())
    }

    /// Disconnect a branch, schedule its firewall's destruction and erase
    /// it; drops the VNI entry when it becomes empty. The caller must have
    /// disabled the branch and refreshed the pollables snapshot first.
    pub(crate) fn detach(
        &mut self,
        ctx: &TopologyCtx<'_>,
        vni: Vni,
        id: &str,
    ) -> Result<(), GraphError> {
        let Some(gvni) = self.vnis.get_mut(&vni) else {
            return Err(GraphError::NoSuchNic {
                id: id.to_string(),
                vni: vni.as_u32(),
            });
        };
        let Some(nic) = gvni.nics.get(id) else {
            return Err(GraphError::NoSuchNic {
                id: id.to_string(),
                vni: vni.as_u32(),
            });
        };
        let head = nic.head.clone();
        let firewall = nic.firewall.brick().clone();

        match gvni.nics.len() {
            1 => ctx.queue.unlink(head),
            2 => {
                // the switch goes away again: disconnect everything, then
                // rewire the surviving branch straight to the endpoint
                let Some(other_head) = gvni
                    .nics
                    .values()
                    .find(|nic| nic.id != id)
                    .map(|nic| nic.head.clone())
                else {
                    return Err(GraphError::SwitchInvariant { vni: vni.as_u32() });
                };
                let switch = gvni.switch.take();
                if let Some(switch) = &switch {
                    ctx.queue.unlink(switch.brick().clone());
                }
                ctx.queue.link(ctx.vtep.clone(), other_head.clone());
                ctx.register_vni(&other_head, vni);
                ctx.queue.wait_empty();
                // last handle: queues the switch destruction
                drop(switch);
            }
            _ => ctx.queue.unlink(head),
        }

        // the firewall handle is manual; its destruction is scheduled here
        if let Err(brick) = ctx.queue.destroy_brick(firewall) {
            ctx.lib.brick_destroy(&brick);
        }
        ctx.queue.wait_empty();

        gvni.nics.remove(id);
        if gvni.nics.is_empty() {
            self.vnis.remove(&vni);
            debug!("vni {vni} has no branches left, removed");
        }
        Ok(())
    }
}
