// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Reference-counted brick ownership with deferred destruction.
//!
//! Bricks are shared between the topology tables and the worker's pollables
//! snapshot; they must never be destroyed while the worker might still poll
//! them. A [`BrickHandle`] therefore routes destruction through the command
//! queue: dropping the last clone enqueues a `BrickDestroy` that the worker
//! executes between poll rounds. When the worker is already gone (shutdown),
//! the drop destroys the brick directly. [`BrickHandle::manual`] creates a
//! handle whose drop does nothing, for bricks destroyed explicitly (the
//! firewall, which the topology tears down by its own queue command before
//! the branch is dropped).

use crate::command::CommandQueue;
use brick::{Brick, BrickLibrary};
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::sync::Arc;

struct HandleInner {
    brick: Brick,
    queue: CommandQueue,
    lib: Arc<dyn BrickLibrary>,
    deferred: bool,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if !self.deferred {
            return;
        }
        if let Err(brick) = self.queue.destroy_brick(self.brick.clone()) {
            self.lib.brick_destroy(&brick);
        }
    }
}

/// A shared, owning reference to a brick.
#[derive(Clone)]
pub(crate) struct BrickHandle {
    inner: Arc<HandleInner>,
}

impl BrickHandle {
    /// A handle that enqueues destruction when its last clone is dropped.
    pub(crate) fn new(brick: Brick, queue: CommandQueue, lib: Arc<dyn BrickLibrary>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                brick,
                queue,
                lib,
                deferred: true,
            }),
        }
    }

    /// A handle whose drop is a no-op; destruction is scheduled explicitly.
    pub(crate) fn manual(brick: Brick, queue: CommandQueue, lib: Arc<dyn BrickLibrary>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                brick,
                queue,
                lib,
                deferred: false,
            }),
        }
    }

    pub(crate) fn brick(&self) -> &Brick {
        &self.inner.brick
    }
}

impl Deref for BrickHandle {
    type Target = Brick;

    fn deref(&self) -> &Brick {
        &self.inner.brick
    }
}

impl Debug for BrickHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BrickHandle({:?})", self.inner.brick)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::command::{Command, command_channel};
    use brick::BrickKind;
    use brick::testing::TestLibrary;

    #[test]
    fn last_drop_enqueues_destroy() {
        let lib: Arc<dyn BrickLibrary> = Arc::new(TestLibrary::new());
        let (queue, receiver) = command_channel();
        let brick = Brick::new("vhost-a", BrickKind::Vhost);
        let handle = BrickHandle::new(brick.clone(), queue, lib);
        let clone = handle.clone();

        drop(handle);
        assert!(receiver.try_recv().is_none());

        drop(clone);
        match receiver.try_recv() {
            Some(Command::BrickDestroy { brick: b }) => assert_eq!(b, brick),
            other => panic!("expected BrickDestroy, got {other:?}"),
        }
    }

    #[test]
    fn manual_handle_never_enqueues() {
        let lib: Arc<dyn BrickLibrary> = Arc::new(TestLibrary::new());
        let (queue, receiver) = command_channel();
        let brick = Brick::new("firewall-a", BrickKind::Firewall);
        drop(BrickHandle::manual(brick, queue, lib));
        assert!(receiver.try_recv().is_none());
    }

    #[test]
    fn drop_falls_back_to_direct_destroy_without_worker() {
        let lib = Arc::new(TestLibrary::new());
        let (queue, receiver) = command_channel();
        drop(receiver);
        let brick = Brick::new("vhost-b", BrickKind::Vhost);
        drop(BrickHandle::new(
            brick,
            queue,
            lib.clone() as Arc<dyn BrickLibrary>,
        ));
        assert!(lib.is_destroyed("vhost-b"));
    }
}
