use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use nix::unistd::{Gid, Group};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::signal::{
    self,
    unix::{SignalKind, signal as unix_signal},
};

use crate::{
    bootstrap,
    config::{self, SupervisorConfig},
    discovery::Discovery,
    layout::Layout,
    logging::ChildOutput,
    runner::{
        Runner,
        reaper::{ChildRegistry, spawn_reaper},
        resolver::CommandResolver,
        terminate::KillScheduler,
    },
    supervisor::Supervisor,
};

#[derive(Parser, Debug)]
#[command(
    name = "hostvisor",
    version,
    about = "Filesystem-driven supervisor for host addons and per-user units"
)]
pub struct Cli {
    /// Supervisor configuration file (TOML)
    #[arg(long, short = 'c', env = "HOSTVISOR_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Root holding the `.runtime` tree
    #[arg(long, env = "HOSTVISOR_ROOT", value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Addon tree snapshotted into the origins at boot [default: <root>/addons]
    #[arg(long = "addons", env = "HOSTVISOR_ADDONS", value_name = "DIR")]
    pub addons: Option<PathBuf>,

    /// Seconds between discovery cycles
    #[arg(long = "poll-interval", env = "HOSTVISOR_POLL_INTERVAL", value_name = "SECONDS")]
    pub poll_interval: Option<u64>,

    /// File name of the per-runnable configuration source
    #[arg(long = "unit-config", env = "HOSTVISOR_UNIT_CONFIG", value_name = "NAME")]
    pub unit_config: Option<String>,

    /// Group every child runs with; an empty value keeps the supervisor's own
    #[arg(long, value_name = "GROUP")]
    pub group: Option<String>,

    /// Do not collect orphaned children
    #[arg(long = "no-reaper", action = ArgAction::SetTrue)]
    pub no_reaper: bool,

    /// Verbose logging
    #[arg(long, short = 'v', action = ArgAction::SetTrue)]
    pub verbose: bool,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let config = self.load_config()?;
        run_supervisor(config).await
    }

    /// Command line beats the configuration file, which beats defaults.
    pub fn load_config(&self) -> Result<SupervisorConfig> {
        let mut config = match &self.config {
            Some(path) => config::load_from_path(path)
                .with_context(|| format!("loading supervisor config {}", path.display()))?,
            None => SupervisorConfig::default(),
        };

        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if let Some(addons) = &self.addons {
            config.addons_source = Some(addons.clone());
        }
        if let Some(seconds) = self.poll_interval {
            if seconds == 0 {
                bail!("--poll-interval must be at least one second");
            }
            config.poll_interval = Duration::from_secs(seconds);
        }
        if let Some(name) = &self.unit_config {
            config.unit_config_name = config::loader::validate_unit_config_name(name.clone())?;
        }
        if let Some(group) = &self.group {
            config.group = config::loader::normalize_group(group.clone());
        }
        if self.no_reaper {
            config.reaper.enabled = false;
        }
        Ok(config)
    }
}

async fn run_supervisor(config: SupervisorConfig) -> Result<()> {
    tracing::info!(root = %config.root.display(), "starting supervisor");

    let group = match &config.group {
        Some(name) => Some(resolve_group(name)?),
        None => None,
    };

    let layout = Layout::new(&config.root);
    let addons = config
        .addons_source
        .clone()
        .unwrap_or_else(|| layout.default_addons_source());
    bootstrap::prepare(&layout, &addons)?;

    let children = ChildRegistry::new();
    if config.reaper.enabled {
        spawn_reaper(children.clone(), config.reaper.interval);
    }

    let resolver = Arc::new(CommandResolver::new(
        config.resolver.program.clone(),
        children.clone(),
    ));
    let runner = Arc::new(Runner::new(
        resolver,
        ChildOutput::stdout(),
        group,
        children,
        config.restart.clone(),
    ));
    let killer = KillScheduler::new(config.termination.escalation.clone(), runner.children().clone());
    let supervisor = Supervisor::new(
        Discovery::new(layout, config.unit_config_name.clone()),
        runner,
        killer,
        config.poll_interval,
    );

    let mut terminate = unix_signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    supervisor
        .run(async move {
            tokio::select! {
                _ = signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        })
        .await;
    Ok(())
}

fn resolve_group(name: &str) -> Result<Gid> {
    match Group::from_name(name) {
        Ok(Some(group)) => {
            tracing::debug!(group = name, gid = group.gid.as_raw(), "resolved supervisor group");
            Ok(group.gid)
        }
        Ok(None) => bail!("supervisor group `{name}` does not exist"),
        Err(error) => Err(error).with_context(|| format!("looking up supervisor group `{name}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use tempfile::NamedTempFile;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("hostvisor").chain(args.iter().copied()))
    }

    #[test]
    fn command_line_overrides_file() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "root = \"/srv/from-file\"\npoll_interval_seconds = 9\ngroup = \"staff\"")?;
        let path = file.path().to_string_lossy().into_owned();

        let config = parse(&["--config", &path, "--poll-interval", "2"]).load_config()?;
        assert_eq!(config.root, PathBuf::from("/srv/from-file"));
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.group.as_deref(), Some("staff"));

        let config = parse(&["--config", &path, "--root", "/srv/cli", "--group", "", "--addons", "/srv/pkg"])
            .load_config()?;
        assert_eq!(config.root, PathBuf::from("/srv/cli"));
        assert_eq!(config.group, None);
        assert_eq!(config.addons_source, Some(PathBuf::from("/srv/pkg")));
        Ok(())
    }

    #[test]
    fn defaults_without_file() -> Result<()> {
        let config = parse(&["--no-reaper", "--unit-config", "unit.py"]).load_config()?;
        assert!(!config.reaper.enabled);
        assert_eq!(config.unit_config_name, "unit.py");
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        Ok(())
    }

    #[test]
    fn rejects_bad_overrides() {
        assert!(parse(&["--poll-interval", "0"]).load_config().is_err());
        assert!(parse(&["--unit-config", "../config.py"]).load_config().is_err());
    }

    #[test]
    fn unknown_group_is_fatal() {
        assert!(resolve_group("hostvisor-no-such-group").is_err());
        assert!(resolve_group("root").is_ok());
    }
}
