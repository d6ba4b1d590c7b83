//! On-disk layout of the unit tree, the origin snapshots and the run-state
//! tree, plus the file names of every marker the supervisor reads or writes.
//!
//! Every path the supervisor derives from a discovered start script goes
//! through [`Layout`], so the mapping from the unit tree to the run-state
//! tree lives in exactly one place.

use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

use crate::runnable::Phase;

pub const DEFAULT_ROOT: &str = "/usr/share/hostvisor";

/// First component under the unit tree that holds addons rather than a user.
pub const ADDONS_DIR: &str = "addons";
/// Directory under the run-state tree that mirrors the origin snapshots.
pub const ORIGINS_DIR: &str = "origins";
/// Where the configuration resolver leaves its JSON output.
pub const RESOLVED_CONFIG_FILE: &str = "config.json";

const RUNTIME_DIR: &str = ".runtime";
const UNITS_DIR: &str = "units";
const RUN_DIR: &str = "run";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
    units: PathBuf,
    origins: PathBuf,
    run: PathBuf,
}

/// Where a unit lives inside the unit tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPlacement {
    /// OS account named by the first component under the unit tree.
    pub user: String,
    /// Symlink (or directory) directly below the user's directory.
    pub link_path: PathBuf,
    /// Run-state subtree owned by this unit.
    pub run_subtree: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runtime = root.join(RUNTIME_DIR);
        Self {
            units: runtime.join(UNITS_DIR),
            origins: runtime.join(ORIGINS_DIR),
            run: runtime.join(RUN_DIR),
            root,
        }
    }

    /// Addon sources shipped with the installation, used unless configured
    /// otherwise.
    pub fn default_addons_source(&self) -> PathBuf {
        self.root.join(ADDONS_DIR)
    }

    pub fn units_dir(&self) -> &Path {
        &self.units
    }

    pub fn origins_dir(&self) -> &Path {
        &self.origins
    }

    pub fn run_dir(&self) -> &Path {
        &self.run
    }

    pub fn ensure_units_dir(&self) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.units)?;
        Ok(self.units.clone())
    }

    /// Drop everything recorded by a previous supervisor and start from an
    /// empty run-state tree.
    pub fn reset_run_dir(&self) -> io::Result<()> {
        recreate_dir(&self.run)
    }

    /// Origin snapshots are taken fresh at every boot.
    pub fn reset_origins_dir(&self) -> io::Result<()> {
        recreate_dir(&self.origins)
    }

    /// Where the addon source tree is linked into the unit tree.
    pub fn addons_link(&self) -> PathBuf {
        self.units.join(ADDONS_DIR)
    }

    /// True when the start script lives below `units/addons`.
    pub fn is_addon(&self, start_script: &Path) -> bool {
        self.first_unit_component(start_script).as_deref() == Some(ADDONS_DIR)
    }

    /// Run-state directory for a start script found in either the unit tree
    /// or the origin snapshots.
    ///
    /// `units/<a>/<b>/x.start` maps to `run/<a>/<b>` and
    /// `origins/<a>/x.start` maps to `run/origins/<a>`. Paths outside both
    /// trees, or scripts sitting directly in a tree root, have no run-state.
    pub fn run_dir_for(&self, start_script: &Path) -> Option<PathBuf> {
        let parent = start_script.parent()?;
        if let Ok(relative) = parent.strip_prefix(&self.origins) {
            if !is_plain_relative(relative) {
                return None;
            }
            return Some(self.run.join(ORIGINS_DIR).join(relative));
        }
        let relative = parent.strip_prefix(&self.units).ok()?;
        if !is_plain_relative(relative) {
            return None;
        }
        Some(self.run.join(relative))
    }

    /// Origin snapshot path that shadows an addon start script.
    pub fn origin_start_for(&self, addon_start: &Path) -> Option<PathBuf> {
        let relative = addon_start
            .strip_prefix(&self.units)
            .ok()?
            .strip_prefix(ADDONS_DIR)
            .ok()?;
        if !is_plain_relative(relative) {
            return None;
        }
        Some(self.origins.join(relative))
    }

    /// Placement of a user unit. Requires at least
    /// `units/<user>/<entry>/<script>` and rejects the addon tree as well as
    /// account names that would collide with reserved run-state directories.
    pub fn unit_placement(&self, start_script: &Path) -> Option<UnitPlacement> {
        let relative = start_script.strip_prefix(&self.units).ok()?;
        if !is_plain_relative(relative) {
            return None;
        }
        let mut components = relative.components();
        let user = component_str(components.next()?)?;
        let entry = component_str(components.next()?)?;
        components.next()?;
        if user == ADDONS_DIR || user == ORIGINS_DIR {
            return None;
        }
        Some(UnitPlacement {
            user: user.to_string(),
            link_path: self.units.join(user).join(entry),
            run_subtree: self.run.join(user).join(entry),
        })
    }

    fn first_unit_component(&self, start_script: &Path) -> Option<String> {
        let relative = start_script.strip_prefix(&self.units).ok()?;
        relative
            .components()
            .next()
            .and_then(component_str)
            .map(str::to_string)
    }
}

fn component_str(component: Component<'_>) -> Option<&str> {
    match component {
        Component::Normal(value) => value.to_str(),
        _ => None,
    }
}

fn recreate_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(error),
    }
    fs::create_dir_all(dir)
}

fn is_plain_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

pub fn start_script_name(name: &str) -> String {
    format!("{name}.start")
}

pub fn stop_script_name(name: &str) -> String {
    format!("{name}.stop")
}

pub fn kill_file_name(name: &str) -> String {
    format!("{name}.kill")
}

pub fn dummy_file_name(name: &str) -> String {
    format!("{name}.origin.dummy")
}

pub fn marker_prefix(name: &str, phase: Phase) -> String {
    format!("{name}.{}.", phase.as_str())
}

pub fn marker_file_name(name: &str, phase: Phase, count: u32) -> String {
    format!("{}{count}", marker_prefix(name, phase))
}

/// Parses the count out of a restart marker, ignoring anything that merely
/// shares the prefix (such as the dummy placeholder).
pub fn parse_marker(file_name: &str, name: &str, phase: Phase) -> Option<u32> {
    let suffix = file_name.strip_prefix(&marker_prefix(name, phase))?;
    if suffix.is_empty() || !suffix.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}
