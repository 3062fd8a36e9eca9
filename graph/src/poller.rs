// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The polling worker.
//!
//! A single OS thread owns every mutation of the live brick graph. Its loop
//! drains the command queue every 1024 iterations, polls the uplink and the
//! current pollables snapshot, and runs the firewall garbage collector every
//! 100000 iterations. The strides amortize queue overhead against poll
//! latency; the short sleep after a GC round yields the core briefly.

use crate::command::{Command, CommandReceiver, PollSnapshot};
use brick::{Brick, BrickLibrary};
use nix::sched::{CpuSet, sched_setaffinity};
use nix::unistd::{Pid, gettid};
use std::num::NonZero;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;
#[allow(unused)]
use tracing::{debug, error, info, warn};

const DRAIN_STRIDE: u32 = 1024;
const GC_MARK: u32 = 100_000;

/// Handle on the running worker thread.
pub(crate) struct Poller {
    thread: JoinHandle<CommandReceiver>,
    tid: Arc<OnceLock<i32>>,
}

impl Poller {
    /// Spawn the worker. It keeps running until an `Exit` command is
    /// dequeued and returns the receiver so leftover commands can be
    /// drained by the caller.
    pub(crate) fn spawn(
        lib: Arc<dyn BrickLibrary>,
        uplink: Brick,
        receiver: CommandReceiver,
        core: Option<usize>,
        socket_dir: PathBuf,
    ) -> std::io::Result<Poller> {
        let tid = Arc::new(OnceLock::new());
        let tid_cell = tid.clone();
        let thread = std::thread::Builder::new()
            .name("graph-poller".to_string())
            .spawn(move || {
                if let Some(core) = core {
                    pin_to_core(core);
                }
                let _ = tid_cell.set(gettid().as_raw());
                let worker = Worker {
                    lib,
                    uplink,
                    receiver,
                    socket_dir,
                    current: PollSnapshot::default(),
                    previous: None,
                };
                worker.run()
            })?;
        Ok(Poller { thread, tid })
    }

    /// Kernel tid of the worker thread, for cgroup classification.
    pub(crate) fn tid(&self) -> Option<i32> {
        self.tid.get().copied()
    }

    /// Join the worker and recover the queue receiver.
    pub(crate) fn join(self) -> Option<CommandReceiver> {
        match self.thread.join() {
            Ok(receiver) => Some(receiver),
            Err(_) => {
                error!("poll worker panicked");
                None
            }
        }
    }
}

fn pin_to_core(core: usize) {
    let cpus = std::thread::available_parallelism()
        .map(NonZero::get)
        .unwrap_or(1);
    if core >= cpus {
        error!("cannot pin poll worker: core {core} not in [0, {cpus})");
        return;
    }
    let mut set = CpuSet::new();
    if let Err(e) = set.set(core) {
        error!("cannot build cpu set for core {core}: {e}");
        return;
    }
    match sched_setaffinity(Pid::from_raw(0), &set) {
        Ok(()) => debug!("poll worker pinned to core {core}"),
        Err(e) => error!("failed to pin poll worker to core {core}: {e}"),
    }
}

struct Worker {
    lib: Arc<dyn BrickLibrary>,
    uplink: Brick,
    receiver: CommandReceiver,
    socket_dir: PathBuf,
    current: PollSnapshot,
    // the snapshot replaced by the last swap; kept alive so its memory is
    // never released inside the hot path
    previous: Option<PollSnapshot>,
}

impl Worker {
    fn run(mut self) -> CommandReceiver {
        info!("poll worker running");
        let mut cnt: u32 = 0;
        loop {
            if cnt % DRAIN_STRIDE == 0 && !self.drain() {
                debug!("poll worker will now exit");
                break;
            }

            if let Err(e) = self.lib.poll(&self.uplink) {
                error!("uplink poll failed: {e}");
            }
            for entry in self.current.entries() {
                if let Err(e) = self.lib.poll(&entry.pollable) {
                    error!("poll of {} failed: {e}", entry.pollable);
                }
            }

            if cnt == GC_MARK {
                for entry in self.current.entries() {
                    self.lib.firewall_gc(&entry.firewall);
                }
                std::thread::sleep(Duration::from_micros(5));
                cnt = 0;
            }
            cnt += 1;
        }
        self.receiver
    }

    /// Execute every queued command in order. Returns false when an `Exit`
    /// was dequeued; commands behind it stay in the queue unexecuted.
    fn drain(&mut self) -> bool {
        while let Some(command) = self.receiver.try_recv() {
            match command {
                Command::Exit => return false,
                Command::VhostStart => {
                    if let Err(e) = self.lib.vhost_start(&self.socket_dir) {
                        error!("vhost start failed: {e}");
                    }
                }
                Command::VhostStop => self.lib.vhost_stop(),
                Command::Link { west, east } => {
                    if let Err(e) = self.lib.link(&west, &east) {
                        error!("link {west} -> {east} failed: {e}");
                    }
                }
                Command::Unlink { brick } => {
                    if let Err(e) = self.lib.unlink(&brick) {
                        error!("unlink of {brick} failed: {e}");
                    }
                }
                Command::UnlinkEdge { west, east } => {
                    if let Err(e) = self.lib.unlink_edge(&west, &east) {
                        error!("unlink edge {west} -> {east} failed: {e}");
                    }
                }
                Command::AddVni {
                    vtep,
                    neighbor,
                    vni,
                    mcast,
                } => {
                    if let Err(e) = self.lib.vtep_add_vni(&vtep, &neighbor, vni, mcast) {
                        error!("add vni {vni} for {neighbor} failed: {e}");
                    }
                }
                Command::UpdatePoll { snapshot } => {
                    self.previous = Some(std::mem::replace(&mut self.current, snapshot));
                }
                Command::FwReload { firewall } => {
                    if let Err(e) = self.lib.firewall_reload(&firewall) {
                        error!("reload of {firewall} failed: {e}");
                    }
                }
                Command::FwNew {
                    name,
                    west_max,
                    east_max,
                    flags,
                    reply,
                } => {
                    let result = self.lib.firewall_new(&name, west_max, east_max, flags);
                    if let Err(e) = &result {
                        error!("creation of firewall '{name}' failed: {e}");
                    }
                    let _ = reply.set(result);
                }
                Command::BrickDestroy { brick } => self.lib.brick_destroy(&brick),
                Command::Nothing => {}
            }
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::command::command_channel;
    use brick::testing::TestLibrary;

    fn setup() -> (Arc<TestLibrary>, Brick) {
        let lib = Arc::new(TestLibrary::new());
        lib.init(&[]).unwrap();
        let uplink = lib.tap_new("tap", None).unwrap();
        (lib, uplink)
    }

    #[test]
    fn executes_commands_in_order_and_exits() {
        let (lib, uplink) = setup();
        let (queue, receiver) = command_channel();
        let poller = Poller::spawn(
            lib.clone(),
            uplink,
            receiver,
            None,
            PathBuf::from("/tmp"),
        )
        .unwrap();

        let a = lib.vhost_new("a").unwrap();
        let b = lib.vhost_new("b").unwrap();
        queue.link(a.clone(), b.clone());
        queue.unlink(a);
        queue.wait_empty();
        assert!(lib.edges().is_empty());

        queue.exit();
        assert!(poller.join().is_some());
    }

    #[test]
    fn snapshot_swap_makes_bricks_polled() {
        let (lib, uplink) = setup();
        let (queue, receiver) = command_channel();
        let poller = Poller::spawn(
            lib.clone(),
            uplink,
            receiver,
            None,
            PathBuf::from("/tmp"),
        )
        .unwrap();

        let vhost = lib.vhost_new("vhost-x").unwrap();
        let fw = lib
            .firewall_new("firewall-x", 1, 1, brick::FirewallFlags::NO_CONN_WORKER)
            .unwrap();
        let snapshot =
            PollSnapshot::from_pairs(std::iter::once((vhost.clone(), fw.clone())));
        queue.update_poll(snapshot);
        queue.wait_empty();

        // the worker now iterates the new snapshot
        std::thread::sleep(Duration::from_millis(50));
        assert!(lib.poll_count(&vhost) > 0);

        queue.exit();
        poller.join();
    }

    #[test]
    fn commands_behind_exit_stay_unexecuted() {
        let (lib, uplink) = setup();
        let (queue, receiver) = command_channel();
        let poller = Poller::spawn(
            lib.clone(),
            uplink,
            receiver,
            None,
            PathBuf::from("/tmp"),
        )
        .unwrap();

        let a = lib.vhost_new("a").unwrap();
        let b = lib.vhost_new("b").unwrap();
        queue.exit();
        queue.link(a, b);

        let leftover = poller.join().unwrap();
        assert!(lib.edges().is_empty());
        assert!(matches!(leftover.try_recv(), Some(Command::Link { .. })));
    }
}
