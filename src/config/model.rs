use std::{path::PathBuf, time::Duration};

use crate::layout::DEFAULT_ROOT;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_UNIT_CONFIG_NAME: &str = "config.py";
pub const DEFAULT_GROUP: &str = "hostvisor";
pub const DEFAULT_RESOLVER_PROGRAM: &str = "python3";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub root: PathBuf,
    /// Addon tree snapshotted into the origins at boot; `<root>/addons`
    /// when unset.
    pub addons_source: Option<PathBuf>,
    pub poll_interval: Duration,
    pub unit_config_name: String,
    /// Group every child runs with; `None` keeps the supervisor's own.
    pub group: Option<String>,
    pub resolver: ResolverConfig,
    pub restart: RestartConfig,
    pub termination: TerminationConfig,
    pub reaper: ReaperConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            addons_source: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            unit_config_name: DEFAULT_UNIT_CONFIG_NAME.to_string(),
            group: Some(DEFAULT_GROUP.to_string()),
            resolver: ResolverConfig::default(),
            restart: RestartConfig::default(),
            termination: TerminationConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub program: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_RESOLVER_PROGRAM.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestartConfig {
    /// Pause between two attempts of the same runnable.
    pub backoff: Duration,
    /// How often a parked runnable checks for its placeholder.
    pub placeholder_poll: Duration,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(1),
            placeholder_poll: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TerminationConfig {
    /// Waits between SIGTERM and SIGKILL; liveness is probed after each.
    pub escalation: Vec<Duration>,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            escalation: vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(1),
        }
    }
}
