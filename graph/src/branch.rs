// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! NIC branch assembly.
//!
//! A branch is the chain of bricks between the tunnel side and the guest:
//! `firewall -> antispoof -> [sniffer ->] endpoint`, or just
//! `[sniffer ->] endpoint` when filtering is bypassed. The firewall is
//! created on the worker through the queue (and fenced) because firewalls
//! must only ever be mutated there; the other bricks are created and linked
//! directly since the branch is not yet part of the live graph.

use crate::command::CommandQueue;
use crate::errors::GraphError;
use crate::handle::BrickHandle;
use crate::model::{Nic, NicType};
use crate::topology::{GraphNic, TopologyCtx};
use brick::{Brick, BrickLibrary, FirewallFlags, Side};
use net::Vni;
use std::fs::File;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
#[allow(unused)]
use tracing::{debug, error, info, warn};

/// Create a pcap sniffer brick writing to `path`.
pub(crate) fn new_sniffer(
    lib: &Arc<dyn BrickLibrary>,
    queue: &CommandQueue,
    id: &str,
    path: &Path,
) -> Result<BrickHandle, GraphError> {
    let file = File::create(path)?;
    let brick = lib.print_new(&format!("sniffer-{id}"), file)?;
    Ok(BrickHandle::new(brick, queue.clone(), lib.clone()))
}

/// Build the branch for `nic` and return it ready to be attached.
pub(crate) fn build_branch(
    lib: &Arc<dyn BrickLibrary>,
    queue: &CommandQueue,
    nic: &Nic,
) -> Result<GraphNic, GraphError> {
    // The firewall is created by the worker; fence, then read the reply.
    let fw_name = format!("firewall-{}", nic.id);
    let reply = queue.fw_new(fw_name, 1, 1, FirewallFlags::NO_CONN_WORKER);
    queue.wait_empty();
    let firewall = match reply.get() {
        Some(Ok(brick)) => brick.clone(),
        Some(Err(e)) => {
            error!("firewall creation failed for nic '{}': {e}", nic.id);
            return Err(GraphError::FirewallCreation(nic.id.clone()));
        }
        None => {
            error!("worker returned no firewall for nic '{}'", nic.id);
            return Err(GraphError::FirewallCreation(nic.id.clone()));
        }
    };
    let firewall = BrickHandle::manual(firewall, queue.clone(), lib.clone());

    let antispoof = BrickHandle::new(
        lib.antispoof_new(&format!("antispoof-{}", nic.id), Side::West, nic.mac)?,
        queue.clone(),
        lib.clone(),
    );
    if nic.ip_anti_spoof {
        for ip in &nic.ip_list {
            if let IpAddr::V4(ip) = ip {
                if let Err(e) = lib.antispoof_arp_add(antispoof.brick(), *ip) {
                    error!("cannot allow arp for {ip} on nic '{}': {e}", nic.id);
                }
            }
        }
        lib.antispoof_arp_enable(antispoof.brick());
    }

    let endpoint = match nic.nic_type {
        NicType::VhostUserServer => lib.vhost_new(&format!("vhost-{}", nic.id))?,
        NicType::Tap => lib.tap_new(&nic.id, Some(&nic.id))?,
    };
    let endpoint = BrickHandle::new(endpoint, queue.clone(), lib.clone());

    let (sniffer, trace_path) = if nic.packet_trace {
        let Some(path) = &nic.packet_trace_path else {
            return Err(GraphError::MissingTracePath(nic.id.clone()));
        };
        (
            Some(new_sniffer(lib, queue, &nic.id, path)?),
            Some(path.clone()),
        )
    } else {
        (None, None)
    };

    // Assemble the chain; the head depends on what sits upstream-most.
    let head = if nic.bypass_filtering {
        if let Some(sniffer) = &sniffer {
            lib.link(sniffer.brick(), endpoint.brick())?;
            sniffer.brick().clone()
        } else {
            endpoint.brick().clone()
        }
    } else {
        lib.link(firewall.brick(), antispoof.brick())?;
        if let Some(sniffer) = &sniffer {
            lib.chained_links(&[antispoof.brick(), sniffer.brick(), endpoint.brick()])?;
        } else {
            lib.link(antispoof.brick(), endpoint.brick())?;
        }
        firewall.brick().clone()
    };

    Ok(GraphNic {
        id: nic.id.clone(),
        enable: true,
        firewall,
        antispoof,
        sniffer,
        endpoint,
        head,
        trace_active: nic.packet_trace,
        trace_path,
    })
}

/// Splice a sniffer into a live branch, in front of the endpoint on a
/// bypassed branch or between antispoof and endpoint on a filtered one.
/// `upstream` is what the branch head hangs off (switch or tunnel
/// endpoint); a branch re-headed directly on the tunnel endpoint must be
/// re-registered under its VNI.
pub(crate) fn splice_sniffer(
    gn: &mut GraphNic,
    bypass: bool,
    ctx: &TopologyCtx<'_>,
    upstream: &Brick,
    vni: Vni,
    sniffer: BrickHandle,
) {
    if bypass {
        ctx.queue.unlink(gn.endpoint.brick().clone());
        gn.head = sniffer.brick().clone();
        ctx.queue
            .link(sniffer.brick().clone(), gn.endpoint.brick().clone());
        ctx.queue.link(upstream.clone(), gn.head.clone());
        if upstream == ctx.vtep {
            ctx.register_vni(&gn.head, vni);
        }
    } else {
        ctx.queue
            .unlink_edge(gn.antispoof.brick().clone(), gn.endpoint.brick().clone());
        ctx.queue
            .link(gn.antispoof.brick().clone(), sniffer.brick().clone());
        ctx.queue
            .link(sniffer.brick().clone(), gn.endpoint.brick().clone());
        // the firewall stays the head of a filtered branch
    }
    gn.sniffer = Some(sniffer);
    gn.trace_active = true;
}

/// Take the sniffer out of a live branch, restoring the plain assembly.
/// The sniffer brick is kept on the branch for reuse; its file stays open
/// until the brick is destroyed.
pub(crate) fn unsplice_sniffer(
    gn: &mut GraphNic,
    bypass: bool,
    ctx: &TopologyCtx<'_>,
    upstream: &Brick,
    vni: Vni,
) -> Result<(), GraphError> {
    let Some(sniffer) = &gn.sniffer else {
        error!("cannot find the sniffer brick of nic '{}'", gn.id);
        return Err(GraphError::NoSniffer(gn.id.clone()));
    };
    ctx.queue.unlink(sniffer.brick().clone());
    if bypass {
        gn.head = gn.endpoint.brick().clone();
        ctx.queue.link(upstream.clone(), gn.head.clone());
        if upstream == ctx.vtep {
            ctx.register_vni(&gn.head, vni);
        }
    } else {
        ctx.queue
            .link(gn.antispoof.brick().clone(), gn.endpoint.brick().clone());
    }
    gn.trace_active = false;
    Ok(())
}
