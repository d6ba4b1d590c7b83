//! Lifecycle controller: runs one runnable, retries it and cleans up after it.

pub mod fallback;
pub mod ledger;
pub mod reaper;
pub mod resolver;
pub mod terminate;

use std::{
    fs, io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use nix::unistd::Gid;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
};

use crate::{
    config::RestartConfig,
    env::build_environment,
    layout::{self, UnitPlacement},
    logging::{ChildOutput, OutputLine, OutputStream},
    runnable::{Phase, Runnable, RunnableConfig},
    state::ManagedEntity,
};

use reaper::ChildRegistry;
use resolver::{ConfigResolver, resolve_or_default};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Idle,
    /// Stopped or finished unit; the entity leaves the registry.
    TornDown,
}

#[derive(Debug)]
pub struct Runner {
    resolver: Arc<dyn ConfigResolver>,
    output: ChildOutput,
    group: Option<Gid>,
    children: ChildRegistry,
    restart: RestartConfig,
}

impl Runner {
    pub fn new(
        resolver: Arc<dyn ConfigResolver>,
        output: ChildOutput,
        group: Option<Gid>,
        children: ChildRegistry,
        restart: RestartConfig,
    ) -> Self {
        Self {
            resolver,
            output,
            group,
            children,
            restart,
        }
    }

    pub fn children(&self) -> &ChildRegistry {
        &self.children
    }

    // The caller owns the claim on `entity` and releases it.
    pub async fn start_and_retry(&self, entity: &ManagedEntity, mut runnable: Runnable) -> RunOutcome {
        let exit_code = loop {
            let (exit_code, limit) = self.run_once(entity, &mut runnable).await;
            if honour_kill_request(entity, &runnable) || limit == 0 || exit_code == 0 {
                break exit_code;
            }
            let attempts = ledger::current(&runnable, Phase::Start);
            if attempts > limit {
                tracing::info!(
                    runnable = %runnable.name,
                    attempts,
                    limit,
                    "retry limit reached"
                );
                break exit_code;
            }
            tokio::time::sleep(self.restart.backoff).await;
        };

        let finished_unit = runnable.unit().is_some() && exit_code == 0;
        if entity.is_stopping() || finished_unit {
            teardown(&runnable);
            return RunOutcome::TornDown;
        }
        RunOutcome::Idle
    }

    async fn run_once(&self, entity: &ManagedEntity, runnable: &mut Runnable) -> (i32, u32) {
        entity.begin_attempt();
        runnable.config = self.resolve(runnable, Phase::Start).await;
        let limit = runnable.config.start.restart_count;

        if let Err(error) = ledger::increment(runnable, Phase::Start) {
            tracing::warn!(%error, runnable = %runnable.name, "failed to record start attempt");
        }

        let started = match self.spawn(runnable, Phase::Start) {
            Ok((mut child, pid)) => {
                entity.record_pid(pid);
                let status = child.wait().await;
                self.children.release(pid);
                entity.clear_pid();
                log_exit(runnable, pid, &status);
                Some(classify_exit(&status))
            }
            Err(error) => {
                tracing::error!(%error, runnable = %runnable.name, "failed to start");
                None
            }
        };
        let exit_code = started.unwrap_or(-1);
        entity.record_exit(exit_code);

        if started.is_some() {
            self.run_stop_hook(runnable).await;
        }

        if exit_code == 0 {
            if let Err(error) = ledger::reset(runnable) {
                tracing::warn!(%error, runnable = %runnable.name, "failed to reset restart counters");
            }
        }
        (exit_code, limit)
    }

    async fn run_stop_hook(&self, runnable: &mut Runnable) {
        if runnable.stop_path.is_none() {
            return;
        }
        if let Err(error) = ledger::increment(runnable, Phase::Stop) {
            tracing::warn!(%error, runnable = %runnable.name, "failed to record stop attempt");
        }
        let resolved = self.resolve(runnable, Phase::Stop).await;
        runnable.config.set_phase(Phase::Stop, resolved.stop);

        match self.spawn(runnable, Phase::Stop) {
            Ok((mut child, pid)) => {
                let status = child.wait().await;
                self.children.release(pid);
                if let Err(error) = &status {
                    tracing::warn!(%error, runnable = %runnable.name, pid, "stop script wait failed");
                } else {
                    log_exit(runnable, pid, &status);
                }
            }
            Err(error) => {
                tracing::warn!(%error, runnable = %runnable.name, "failed to run stop script");
            }
        }
    }

    async fn resolve(&self, runnable: &Runnable, phase: Phase) -> RunnableConfig {
        let resolver = self.resolver.clone();
        let target = runnable.clone();
        match tokio::task::spawn_blocking(move || resolve_or_default(resolver.as_ref(), &target, phase)).await {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(%error, runnable = %runnable.name, %phase, "config resolution task failed");
                RunnableConfig::default()
            }
        }
    }

    fn spawn(&self, runnable: &Runnable, phase: Phase) -> Result<(Child, u32)> {
        let script = runnable
            .script(phase)
            .ok_or_else(|| anyhow!("{} has no {} script", runnable.name, phase))?;
        let config = runnable.config.phase(phase);

        let mut command = Command::new(script);
        command.args(&config.params);
        command.envs(build_environment(runnable, config));
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        if let Some(dir) = config.working_dir() {
            command.current_dir(dir);
        }
        if let Some(owner) = runnable.owner() {
            command.uid(owner.uid.as_raw());
            command.gid(self.group.unwrap_or(owner.gid).as_raw());
        } else if let Some(group) = self.group {
            command.gid(group.as_raw());
        }

        let mut child = self
            .children
            .spawn_async(&mut command)
            .with_context(|| format!("spawning {}", script.display()))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("{} exited before its pid was read", script.display()))?;

        tracing::info!(
            runnable = %runnable.name,
            kind = runnable.kind.process_type(),
            %phase,
            pid,
            "started"
        );

        if let Some(stdout) = child.stdout.take() {
            self.spawn_stream_task(pid, OutputStream::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_stream_task(pid, OutputStream::Stderr, stderr);
        }
        Ok((child, pid))
    }

    fn spawn_stream_task<R>(&self, pid: u32, stream: OutputStream, reader: R)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let output = self.output.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Err(error) = output.emit(OutputLine::new(pid, stream, &line)) {
                    tracing::error!(%error, pid, "failed to write child output");
                }
            }
        });
    }

    pub async fn watch_dummy(&self, entity: &ManagedEntity, runnable: &Runnable) {
        let placeholder = runnable
            .run_dir
            .join(layout::dummy_file_name(&runnable.name));
        entity.park();

        let stop_at = runnable
            .unit()
            .and_then(|unit| unit.placement.run_subtree.parent());
        match ledger::touch_owned(&placeholder, runnable.owner(), stop_at) {
            Ok(()) => tracing::warn!(
                runnable = %runnable.name,
                path = %placeholder.display(),
                "no fallback left; remove the placeholder to start again"
            ),
            Err(error) => tracing::error!(
                %error,
                runnable = %runnable.name,
                path = %placeholder.display(),
                "failed to create placeholder"
            ),
        }

        while matches!(placeholder.try_exists(), Ok(true)) {
            tokio::time::sleep(self.restart.placeholder_poll).await;
        }

        tracing::info!(runnable = %runnable.name, "placeholder removed; resuming");
        if let Err(error) = ledger::reset(runnable) {
            tracing::warn!(%error, runnable = %runnable.name, "failed to reset restart counters");
        }
        entity.resume_after_dummy();
    }
}

fn classify_exit(status: &io::Result<ExitStatus>) -> i32 {
    match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => -1,
    }
}

fn log_exit(runnable: &Runnable, pid: u32, status: &io::Result<ExitStatus>) {
    match status {
        Ok(status) => tracing::info!(
            runnable = %runnable.name,
            pid,
            "{}",
            exit_message(status)
        ),
        Err(error) => tracing::error!(%error, runnable = %runnable.name, pid, "child wait failed"),
    }
}

fn exit_message(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        format!("exited with code {code}")
    } else if let Some(signal) = exit_signal(status) {
        format!("terminated by signal {signal}")
    } else {
        "process exited".to_string()
    }
}

fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

/// Also catches requests no poll saw, e.g. when the process crashed first.
/// Killing an origin ends its run but not the entity.
fn honour_kill_request(entity: &ManagedEntity, runnable: &Runnable) -> bool {
    let requested = matches!(kill_sentinel(runnable).try_exists(), Ok(true));
    if requested && !runnable.is_origin() {
        entity.mark_stopping();
    }
    if !requested && !entity.is_stopping() {
        return false;
    }
    tracing::info!(runnable = %runnable.name, "kill request honoured");
    remove_kill_sentinel(runnable);
    true
}

fn kill_sentinel(runnable: &Runnable) -> PathBuf {
    runnable.run_dir.join(layout::kill_file_name(&runnable.name))
}

fn remove_kill_sentinel(runnable: &Runnable) {
    let sentinel = kill_sentinel(runnable);
    match fs::remove_file(&sentinel) {
        Ok(()) => tracing::debug!(path = %sentinel.display(), "kill request consumed"),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => {
            tracing::warn!(%error, path = %sentinel.display(), "failed to remove kill request")
        }
    }
}

// Addons only lose their kill request.
fn teardown(runnable: &Runnable) {
    remove_kill_sentinel(runnable);
    let Some(unit) = runnable.unit() else {
        tracing::info!(runnable = %runnable.name, "addon stopped");
        return;
    };
    remove_unit_files(&runnable.name, &unit.placement);
}

fn remove_unit_files(name: &str, placement: &UnitPlacement) {
    let link = &placement.link_path;
    match fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => match fs::remove_file(link) {
            Ok(()) => {
                tracing::info!(runnable = %name, path = %link.display(), "unit unlinked");
                remove_dir_if_empty(link.parent());
            }
            Err(error) => {
                tracing::warn!(%error, path = %link.display(), "failed to unlink unit")
            }
        },
        Ok(_) => tracing::warn!(
            path = %link.display(),
            "unit entry is not a symlink; leaving it in place"
        ),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => tracing::warn!(%error, path = %link.display(), "failed to inspect unit entry"),
    }

    match fs::remove_dir_all(&placement.run_subtree) {
        Ok(()) => tracing::debug!(path = %placement.run_subtree.display(), "run state removed"),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => tracing::warn!(
            %error,
            path = %placement.run_subtree.display(),
            "failed to remove run state"
        ),
    }
    remove_dir_if_empty(placement.run_subtree.parent());
}

fn remove_dir_if_empty(dir: Option<&Path>) {
    // remove_dir refuses non-empty directories.
    if let Some(dir) = dir {
        if fs::remove_dir(dir).is_ok() {
            tracing::debug!(path = %dir.display(), "removed empty directory");
        }
    }
}
