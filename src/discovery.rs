//! Walks the unit tree and builds one poll's snapshot of runnables.

use std::{
    collections::{BTreeMap, HashSet},
    fs, io,
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

use nix::unistd::User;

use crate::{
    layout::{self, Layout},
    runnable::{Discovered, Owner, Runnable, RunnableConfig, RunnableId, RunnableKind, UnitTarget},
};

#[derive(Debug, Clone)]
pub struct Discovery {
    layout: Layout,
    config_name: String,
}

impl Discovery {
    pub fn new(layout: Layout, config_name: impl Into<String>) -> Self {
        Self {
            layout,
            config_name: config_name.into(),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Every valid runnable currently in the unit tree, keyed by identity.
    /// Faults are logged and only drop the affected entry.
    pub fn scan(&self) -> BTreeMap<RunnableId, Discovered> {
        let mut found = BTreeMap::new();
        for start in self.start_scripts() {
            if let Some(discovered) = self.inspect(&start) {
                found.insert(discovered.id().clone(), discovered);
            }
        }
        found
    }

    fn start_scripts(&self) -> Vec<PathBuf> {
        let root = self.layout.units_dir();
        let mut scripts = Vec::new();
        let mut visited = HashSet::new();
        let mut pending = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let real = match fs::canonicalize(&dir) {
                Ok(real) => real,
                Err(error) => {
                    log_walk_error(&dir, &error);
                    continue;
                }
            };
            // Symlinked directories may point back up the tree.
            if !visited.insert(real) {
                continue;
            }
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(error) => {
                    log_walk_error(&dir, &error);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                // Follows symlinks, which is how addons enter the tree.
                let metadata = match fs::metadata(&path) {
                    Ok(metadata) => metadata,
                    Err(error) => {
                        tracing::debug!(%error, path = %path.display(), "skipping unreadable entry");
                        continue;
                    }
                };
                if metadata.is_dir() {
                    pending.push(path);
                } else if metadata.is_file()
                    && metadata.permissions().mode() & 0o111 != 0
                    && is_start_script_name(&path)
                {
                    scripts.push(path);
                }
            }
        }
        scripts.sort();
        scripts
    }

    fn inspect(&self, start: &Path) -> Option<Discovered> {
        if self.layout.is_addon(start) {
            let current = self.runnable(start, start, RunnableKind::Addon)?;
            let origin = self
                .layout
                .origin_start_for(start)
                .filter(|origin| is_executable_file(origin))
                .and_then(|origin| self.runnable(start, &origin, RunnableKind::Origin));
            return Some(Discovered::Addon { current, origin });
        }

        let Some(placement) = self.layout.unit_placement(start) else {
            tracing::debug!(path = %start.display(), "start script outside any user directory");
            return None;
        };
        let owner = match User::from_name(&placement.user) {
            Ok(Some(user)) => Owner {
                name: user.name,
                uid: user.uid,
                gid: user.gid,
            },
            Ok(None) => {
                tracing::warn!(user = %placement.user, path = %start.display(), "unit belongs to unknown account; skipping");
                return None;
            }
            Err(error) => {
                tracing::warn!(%error, user = %placement.user, "failed to look up unit owner");
                return None;
            }
        };

        let file_uid = match fs::symlink_metadata(start) {
            Ok(metadata) => metadata.uid(),
            Err(error) => {
                tracing::warn!(%error, path = %start.display(), "failed to stat unit start script");
                return None;
            }
        };
        if file_uid != owner.uid.as_raw() {
            tracing::error!(
                path = %start.display(),
                user = %owner.name,
                expected_uid = owner.uid.as_raw(),
                file_uid,
                "security violation: start script not owned by unit account; refusing to run"
            );
            return None;
        }

        let kind = RunnableKind::Unit(UnitTarget { owner, placement });
        self.runnable(start, start, kind).map(Discovered::Unit)
    }

    fn runnable(&self, id: &Path, start: &Path, kind: RunnableKind) -> Option<Runnable> {
        let dir = start.parent()?;
        let name = dir.file_name()?.to_str()?.to_string();
        let Some(run_dir) = self.layout.run_dir_for(start) else {
            tracing::debug!(path = %start.display(), "no run directory for start script");
            return None;
        };
        let stop = dir.join(layout::stop_script_name(&name));
        let config = dir.join(&self.config_name);
        Some(Runnable {
            id: id.to_path_buf(),
            kind,
            start_path: start.to_path_buf(),
            stop_path: stop.is_file().then_some(stop),
            config_path: config.is_file().then_some(config),
            modified: fs::metadata(start).and_then(|meta| meta.modified()).ok(),
            run_dir,
            config: RunnableConfig::default(),
            name,
        })
    }
}

fn is_start_script_name(path: &Path) -> bool {
    let Some(dir_name) = path
        .parent()
        .and_then(Path::file_name)
        .and_then(|name| name.to_str())
    else {
        return false;
    };
    path.file_name().and_then(|name| name.to_str()) == Some(layout::start_script_name(dir_name).as_str())
}

fn is_executable_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn log_walk_error(dir: &Path, error: &io::Error) {
    if error.kind() == io::ErrorKind::NotFound {
        tracing::info!(dir = %dir.display(), "unit directory missing");
    } else {
        tracing::warn!(%error, dir = %dir.display(), "failed to read unit directory");
    }
}
