//! Discovered runnables and their resolved execution parameters.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    time::SystemTime,
};

use nix::unistd::{Gid, Uid};
use serde::Deserialize;

use crate::layout::UnitPlacement;

/// Stable identity of a managed entity: the path of the current start
/// script as found in the unit tree. An addon's origin shares the identity
/// of the addon it stands in for.
pub type RunnableId = PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Start,
    Stop,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::Stop => "stop",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OS account a unit runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitTarget {
    pub owner: Owner,
    pub placement: UnitPlacement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnableKind {
    /// Current implementation of a privileged addon.
    Addon,
    /// Fallback implementation of an addon.
    Origin,
    /// Per-user process running with the owner's credentials.
    Unit(UnitTarget),
}

impl RunnableKind {
    pub fn process_type(&self) -> &'static str {
        match self {
            RunnableKind::Addon => "addon",
            RunnableKind::Origin => "origin",
            RunnableKind::Unit(_) => "unit",
        }
    }

    pub fn process_user(&self) -> &str {
        match self {
            RunnableKind::Unit(unit) => &unit.owner.name,
            RunnableKind::Addon | RunnableKind::Origin => "root",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Runnable {
    pub id: RunnableId,
    pub name: String,
    pub kind: RunnableKind,
    pub start_path: PathBuf,
    pub stop_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub modified: Option<SystemTime>,
    pub run_dir: PathBuf,
    /// Empty at discovery; filled by the controller before every spawn.
    pub config: RunnableConfig,
}

impl Runnable {
    pub fn script(&self, phase: Phase) -> Option<&Path> {
        match phase {
            Phase::Start => Some(self.start_path.as_path()),
            Phase::Stop => self.stop_path.as_deref(),
        }
    }

    pub fn is_origin(&self) -> bool {
        matches!(self.kind, RunnableKind::Origin)
    }

    pub fn unit(&self) -> Option<&UnitTarget> {
        match &self.kind {
            RunnableKind::Unit(unit) => Some(unit),
            RunnableKind::Addon | RunnableKind::Origin => None,
        }
    }

    pub fn owner(&self) -> Option<&Owner> {
        self.unit().map(|unit| &unit.owner)
    }
}

/// One poll's view of an identity. Only addons can carry an origin.
#[derive(Debug, Clone, PartialEq)]
pub enum Discovered {
    Addon {
        current: Runnable,
        origin: Option<Runnable>,
    },
    Unit(Runnable),
}

impl Discovered {
    pub fn current(&self) -> &Runnable {
        match self {
            Discovered::Addon { current, .. } => current,
            Discovered::Unit(unit) => unit,
        }
    }

    pub fn origin(&self) -> Option<&Runnable> {
        match self {
            Discovered::Addon { origin, .. } => origin.as_ref(),
            Discovered::Unit(_) => None,
        }
    }

    pub fn id(&self) -> &RunnableId {
        &self.current().id
    }

    pub fn is_addon(&self) -> bool {
        matches!(self, Discovered::Addon { .. })
    }
}

/// Output of the configuration resolver, decoded from JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RunnableConfig {
    #[serde(default)]
    pub start: PhaseConfig,
    #[serde(default)]
    pub stop: PhaseConfig,
}

impl RunnableConfig {
    pub fn phase(&self, phase: Phase) -> &PhaseConfig {
        match phase {
            Phase::Start => &self.start,
            Phase::Stop => &self.stop,
        }
    }

    pub fn set_phase(&mut self, phase: Phase, config: PhaseConfig) {
        match phase {
            Phase::Start => self.start = config,
            Phase::Stop => self.stop = config,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseConfig {
    /// Maximum restart attempts; zero disables retrying.
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub wd: Option<String>,
}

impl PhaseConfig {
    pub fn working_dir(&self) -> Option<&Path> {
        self.wd
            .as_deref()
            .filter(|dir| !dir.is_empty())
            .map(Path::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_resolver_output() {
        let json = r#"{
            "timer": 0,
            "start": {
                "restartCount": 3,
                "envs": {"PORT": "8080"},
                "params": ["--serve"],
                "wd": "/srv/app"
            },
            "stop": {"restartCount": 0, "envs": {}, "params": [], "wd": ""}
        }"#;
        let config: RunnableConfig = serde_json::from_str(json).expect("decoded");
        assert_eq!(config.start.restart_count, 3);
        assert_eq!(config.start.envs.get("PORT").map(String::as_str), Some("8080"));
        assert_eq!(config.start.params, vec!["--serve".to_string()]);
        assert_eq!(config.start.working_dir(), Some(Path::new("/srv/app")));
        assert_eq!(config.stop.working_dir(), None);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config: RunnableConfig = serde_json::from_str(r#"{"start": {}}"#).expect("decoded");
        assert_eq!(config, RunnableConfig::default());
        assert_eq!(config.phase(Phase::Stop).restart_count, 0);
    }
}
