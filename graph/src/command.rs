// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The typed mutation protocol between the control thread and the worker.
//!
//! Commands are the only way the control thread changes the live graph. The
//! queue is strict FIFO; the worker drains it between poll rounds and
//! executes every command in enqueue order. [`CommandQueue::wait_empty`]
//! turns the queue into a fence: after it returns, every previously enqueued
//! command has been executed.

use brick::{Brick, BrickError, FirewallFlags};
use crossbeam::channel::{Receiver, Sender, unbounded};
use net::Vni;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

/// Capacity of the pollables snapshot. Branches past this many enabled NICs
/// are not polled; exceeding it logs an error and drops further entries.
pub(crate) const MAX_POLLABLE_BRICKS: usize = 256;

/// Result cell of a [`Command::FwNew`]: written once by the worker, read by
/// the control thread after a queue fence.
pub(crate) type FwNewReply = Arc<OnceLock<Result<Brick, BrickError>>>;

/// One entry of the pollables snapshot: the brick to poll and the firewall
/// whose connection-tracking state is garbage-collected alongside it.
#[derive(Debug, Clone)]
pub(crate) struct PollEntry {
    pub pollable: Brick,
    pub firewall: Brick,
}

/// The immutable array of pollable branches the worker iterates each cycle.
#[derive(Debug, Default)]
pub(crate) struct PollSnapshot {
    entries: Vec<PollEntry>,
}

impl PollSnapshot {
    pub(crate) fn from_pairs(pairs: impl Iterator<Item = (Brick, Brick)>) -> Self {
        let mut entries = Vec::new();
        let mut dropped = 0usize;
        for (pollable, firewall) in pairs {
            if entries.len() >= MAX_POLLABLE_BRICKS {
                dropped += 1;
                continue;
            }
            entries.push(PollEntry { pollable, firewall });
        }
        if dropped > 0 {
            tracing::error!("not enough pollable brick slots: {dropped} branches will not be polled");
        }
        Self { entries }
    }

    pub(crate) fn entries(&self) -> &[PollEntry] {
        &self.entries
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A mutation executed by the polling worker.
#[derive(Debug)]
pub(crate) enum Command {
    /// Terminate the worker. Commands behind it are drained unexecuted.
    Exit,
    /// Bring up the vhost-user socket directory.
    VhostStart,
    /// Tear vhost-user down.
    VhostStop,
    /// Connect west's east-side port to east's west-side port.
    Link { west: Brick, east: Brick },
    /// Remove every edge of the brick.
    Unlink { brick: Brick },
    /// Remove only the (west, east) edge.
    UnlinkEdge { west: Brick, east: Brick },
    /// Register `neighbor` under `vni` at the tunnel endpoint.
    AddVni {
        vtep: Brick,
        neighbor: Brick,
        vni: Vni,
        mcast: IpAddr,
    },
    /// Replace the pollables snapshot by swap.
    UpdatePoll { snapshot: PollSnapshot },
    /// Recompile the installed rules of a firewall.
    FwReload { firewall: Brick },
    /// Create a firewall on the worker and publish it through `reply`.
    FwNew {
        name: String,
        west_max: u32,
        east_max: u32,
        flags: FirewallFlags,
        reply: FwNewReply,
    },
    /// Destroy a brick.
    BrickDestroy { brick: Brick },
    /// No-op; used as the fence marker of [`CommandQueue::wait_empty`].
    Nothing,
}

/// Multi-producer handle to the command queue.
#[derive(Clone)]
pub(crate) struct CommandQueue {
    tx: Sender<Command>,
}

/// Single-consumer end, owned by the polling worker.
pub(crate) struct CommandReceiver {
    rx: Receiver<Command>,
}

pub(crate) fn command_channel() -> (CommandQueue, CommandReceiver) {
    let (tx, rx) = unbounded();
    (CommandQueue { tx }, CommandReceiver { rx })
}

impl CommandQueue {
    fn push(&self, command: Command) {
        if self.tx.send(command).is_err() {
            // the worker is gone; shutdown paths destroy bricks directly
            debug!("command queue is closed, command dropped");
        }
    }

    pub(crate) fn exit(&self) {
        self.push(Command::Exit);
    }

    pub(crate) fn vhost_start(&self) {
        self.push(Command::VhostStart);
    }

    pub(crate) fn vhost_stop(&self) {
        self.push(Command::VhostStop);
    }

    pub(crate) fn link(&self, west: Brick, east: Brick) {
        self.push(Command::Link { west, east });
    }

    pub(crate) fn unlink(&self, brick: Brick) {
        self.push(Command::Unlink { brick });
    }

    pub(crate) fn unlink_edge(&self, west: Brick, east: Brick) {
        self.push(Command::UnlinkEdge { west, east });
    }

    pub(crate) fn add_vni(&self, vtep: Brick, neighbor: Brick, vni: Vni, mcast: IpAddr) {
        self.push(Command::AddVni {
            vtep,
            neighbor,
            vni,
            mcast,
        });
    }

    pub(crate) fn update_poll(&self, snapshot: PollSnapshot) {
        self.push(Command::UpdatePoll { snapshot });
    }

    pub(crate) fn fw_reload(&self, firewall: Brick) {
        self.push(Command::FwReload { firewall });
    }

    /// Enqueue a firewall creation and hand back the reply cell. The cell is
    /// guaranteed to be populated once [`wait_empty`](Self::wait_empty)
    /// returns.
    pub(crate) fn fw_new(
        &self,
        name: String,
        west_max: u32,
        east_max: u32,
        flags: FirewallFlags,
    ) -> FwNewReply {
        let reply: FwNewReply = Arc::new(OnceLock::new());
        self.push(Command::FwNew {
            name,
            west_max,
            east_max,
            flags,
            reply: reply.clone(),
        });
        reply
    }

    /// Enqueue a brick destruction. Returns the brick when the worker is no
    /// longer there to execute it, so the caller can destroy directly.
    pub(crate) fn destroy_brick(&self, brick: Brick) -> Result<(), Brick> {
        self.tx
            .send(Command::BrickDestroy { brick })
            .map_err(|err| match err.into_inner() {
                Command::BrickDestroy { brick } => brick,
                _ => unreachable!(),
            })
    }

    pub(crate) fn nothing(&self) {
        self.push(Command::Nothing);
    }

    /// Fence: enqueue a no-op and poll the queue length until the worker has
    /// drained everything ahead of it.
    pub(crate) fn wait_empty(&self) {
        self.nothing();
        while !self.tx.is_empty() {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl CommandReceiver {
    pub(crate) fn try_recv(&self) -> Option<Command> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use brick::BrickKind;

    #[test]
    fn commands_keep_enqueue_order() {
        let (queue, receiver) = command_channel();
        let a = Brick::new("a", BrickKind::Vhost);
        let b = Brick::new("b", BrickKind::Vhost);
        queue.link(a.clone(), b.clone());
        queue.unlink_edge(a.clone(), b.clone());
        queue.unlink(a);
        queue.nothing();

        assert!(matches!(receiver.try_recv(), Some(Command::Link { .. })));
        assert!(matches!(
            receiver.try_recv(),
            Some(Command::UnlinkEdge { .. })
        ));
        assert!(matches!(receiver.try_recv(), Some(Command::Unlink { .. })));
        assert!(matches!(receiver.try_recv(), Some(Command::Nothing)));
        assert!(receiver.try_recv().is_none());
    }

    #[test]
    fn snapshot_caps_at_capacity() {
        let pairs = (0..MAX_POLLABLE_BRICKS + 10).map(|i| {
            (
                Brick::new(format!("vhost-{i}"), BrickKind::Vhost),
                Brick::new(format!("firewall-{i}"), BrickKind::Firewall),
            )
        });
        let snapshot = PollSnapshot::from_pairs(pairs);
        assert_eq!(snapshot.len(), MAX_POLLABLE_BRICKS);
    }

    #[test]
    fn destroy_returns_brick_when_closed() {
        let (queue, receiver) = command_channel();
        drop(receiver);
        let brick = Brick::new("orphan", BrickKind::Vhost);
        let returned = queue.destroy_brick(brick.clone()).unwrap_err();
        assert_eq!(returned, brick);
    }
}
