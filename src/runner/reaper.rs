//! Zombie collection for children the supervisor does not wait on itself.
//!
//! Units may double-fork or leave grandchildren behind; once re-parented to
//! the supervisor they have to be reaped somewhere. Children spawned by a
//! controller are registered in [`ChildRegistry`] and stay untouched so the
//! controller still observes their real exit status.

use std::{collections::HashSet, io, process, sync::Arc, time::Duration};

use nix::{
    errno::Errno,
    sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid},
};
use parking_lot::Mutex;
use tokio::{process::Command, task::JoinHandle};

/// Pids whose exit status belongs to a live controller.
#[derive(Debug, Clone, Default)]
pub struct ChildRegistry {
    owned: Arc<Mutex<HashSet<u32>>>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns and registers under one lock so the reaper cannot collect a
    /// child that exits before it is recorded.
    pub fn spawn_async(&self, command: &mut Command) -> io::Result<tokio::process::Child> {
        let mut owned = self.owned.lock();
        let child = command.spawn()?;
        if let Some(pid) = child.id() {
            owned.insert(pid);
        }
        Ok(child)
    }

    pub fn spawn_std(&self, command: &mut process::Command) -> io::Result<process::Child> {
        let mut owned = self.owned.lock();
        let child = command.spawn()?;
        owned.insert(child.id());
        Ok(child)
    }

    /// Hands the pid back to the reaper once its owner has waited on it.
    pub fn release(&self, pid: u32) {
        self.owned.lock().remove(&pid);
    }

    pub fn owns(&self, pid: u32) -> bool {
        self.owned.lock().contains(&pid)
    }

    /// Runs `action` only while `pid` is still owned. Holding the lock keeps
    /// the owner from releasing the pid in between.
    pub fn with_owned<T>(&self, pid: u32, action: impl FnOnce() -> T) -> Option<T> {
        let owned = self.owned.lock();
        owned.contains(&pid).then(action)
    }
}

/// Collects every exited child not owned by a controller and returns how
/// many were reaped. Stops at the first owned zombie; its controller is
/// about to wait on it and the next round continues from there.
pub fn reap_orphans(children: &ChildRegistry) -> usize {
    let mut reaped = 0;
    loop {
        let owned = children.owned.lock();
        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
        let status = match waitid(Id::All, flags) {
            Ok(status) => status,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(error) => {
                tracing::warn!(%error, "failed to inspect exited children");
                break;
            }
        };
        let Some(pid) = status.pid() else {
            break;
        };
        if owned.contains(&(pid.as_raw() as u32)) {
            break;
        }
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                reaped += 1;
                tracing::debug!(pid = pid.as_raw(), ?status, "reaped orphaned child");
            }
            Err(Errno::ECHILD) => {}
            Err(error) => {
                tracing::warn!(%error, pid = pid.as_raw(), "failed to reap child");
                break;
            }
        }
    }
    reaped
}

pub fn spawn_reaper(children: ChildRegistry, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            reap_orphans(&children);
        }
    })
}
