use std::{collections::HashSet, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill as send_unix_signal},
    unistd::Pid,
};
use parking_lot::Mutex;

use crate::{layout, state::EntityState};

use super::reaper::ChildRegistry;

pub fn signal_process(pid: u32, signal: Signal) -> Result<()> {
    match send_unix_signal(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(()),
        Err(err) if err == Errno::ESRCH => Ok(()),
        Err(err) => Err(anyhow!(
            "failed to send {:?} to pid {}: {}",
            signal,
            pid,
            err
        )),
    }
}

/// Probes with signal 0. A process we may not signal still exists.
pub fn is_alive(pid: u32) -> bool {
    match send_unix_signal(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(err) => err == Errno::EPERM,
    }
}

/// Kill-request sentinel of the implementation the entity is running.
pub fn kill_sentinel_path(state: &EntityState) -> PathBuf {
    let runnable = state.active_runnable();
    runnable.run_dir.join(layout::kill_file_name(&runnable.name))
}

/// Deferred SIGKILL escalation. At most one escalation per pid is in
/// flight; later requests for the same pid are dropped. Only pids a
/// controller still owns are killed, so a recycled pid is never hit.
#[derive(Debug, Clone)]
pub struct KillScheduler {
    pending: Arc<Mutex<HashSet<u32>>>,
    steps: Arc<[Duration]>,
    children: ChildRegistry,
}

impl KillScheduler {
    pub fn new(steps: Vec<Duration>, children: ChildRegistry) -> Self {
        Self {
            pending: Arc::default(),
            steps: steps.into(),
            children,
        }
    }

    /// Returns false when an escalation for `pid` is already running.
    pub fn schedule(&self, pid: u32) -> bool {
        if !self.pending.lock().insert(pid) {
            tracing::debug!(pid, "SIGKILL already scheduled");
            return false;
        }
        let guard = PendingGuard {
            pending: self.pending.clone(),
            pid,
        };
        let steps = self.steps.clone();
        let children = self.children.clone();
        tokio::spawn(async move {
            let _guard = guard;
            for step in steps.iter() {
                tokio::time::sleep(*step).await;
                if !children.owns(pid) || !is_alive(pid) {
                    tracing::debug!(pid, "process exited before SIGKILL");
                    return;
                }
            }
            let sent = children.with_owned(pid, || {
                tracing::warn!(pid, "process survived SIGTERM; sending SIGKILL");
                signal_process(pid, Signal::SIGKILL)
            });
            match sent {
                Some(Ok(())) => {}
                Some(Err(error)) => tracing::error!(%error, pid, "failed to send SIGKILL"),
                None => tracing::debug!(pid, "process released before SIGKILL"),
            }
        });
        true
    }
}

/// Clears the bookkeeping however the escalation task ends.
struct PendingGuard {
    pending: Arc<Mutex<HashSet<u32>>>,
    pid: u32,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.pid);
    }
}
