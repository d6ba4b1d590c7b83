//! Restart counters persisted as marker files in the run-state tree.
//!
//! A runnable named `web` accumulates `web.start.1`, `web.start.2`, ... and
//! `web.stop.N` next to each other; the highest suffix is the current count.
//! Markers survive supervisor restarts only as long as the run-state tree
//! does.

use std::{
    fs::{self, File, OpenOptions},
    io,
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    path::Path,
};

use nix::{
    errno::Errno,
    fcntl::{AtFlags, OFlag},
    unistd::{fchown, fchownat},
};

use crate::{
    layout,
    runnable::{Owner, Phase, Runnable},
};

/// Highest recorded attempt for `phase`, or zero without markers.
pub fn current(runnable: &Runnable, phase: Phase) -> u32 {
    match highest_marker(&runnable.run_dir, &runnable.name, phase) {
        Ok(count) => count,
        Err(error) if error.kind() == io::ErrorKind::NotFound => 0,
        Err(error) => {
            tracing::warn!(
                %error,
                runnable = %runnable.name,
                dir = %runnable.run_dir.display(),
                "failed to read restart markers"
            );
            0
        }
    }
}

/// Records one more attempt and returns the new count.
pub fn increment(runnable: &Runnable, phase: Phase) -> io::Result<u32> {
    let next = current(runnable, phase).saturating_add(1);
    let path = runnable
        .run_dir
        .join(layout::marker_file_name(&runnable.name, phase, next));
    let stop_at = runnable
        .unit()
        .and_then(|unit| unit.placement.run_subtree.parent());
    touch_owned(&path, runnable.owner(), stop_at)?;
    Ok(next)
}

/// Removes every start and stop marker of the runnable, returning how many
/// were deleted.
pub fn reset(runnable: &Runnable) -> io::Result<usize> {
    let entries = match fs::read_dir(&runnable.run_dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(error) => return Err(error),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let is_marker = [Phase::Start, Phase::Stop]
            .into_iter()
            .any(|phase| layout::parse_marker(name, &runnable.name, phase).is_some());
        if !is_marker {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(error),
        }
    }
    Ok(removed)
}

fn highest_marker(dir: &Path, name: &str, phase: Phase) -> io::Result<u32> {
    let mut highest = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(count) = entry
            .file_name()
            .to_str()
            .and_then(|file_name| layout::parse_marker(file_name, name, phase))
        {
            highest = highest.max(count);
        }
    }
    Ok(highest)
}

/// Creates `path` if it does not exist yet. For units the file and every
/// directory from `stop_at` down are handed to the owner so per-user run
/// state stays private to that user. Those directories are writable by the
/// owner, so nothing below `stop_at` is trusted: symlinks and non-regular
/// entries are refused instead of followed.
pub(crate) fn touch_owned(path: &Path, owner: Option<&Owner>, stop_at: Option<&Path>) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other(format!("{} has no parent directory", path.display())))?;
    let Some(owner) = owner else {
        fs::create_dir_all(parent)?;
        open_marker(path)?;
        return Ok(());
    };

    match stop_at {
        Some(stop_at) if parent.starts_with(stop_at) => create_owned_dirs(parent, stop_at, owner)?,
        _ => {
            fs::create_dir_all(parent)?;
            ensure_real_dir(parent)?;
        }
    }
    let file = open_marker(path)?;
    if let Err(error) = fchown(file.as_raw_fd(), Some(owner.uid), Some(owner.gid)) {
        warn_chown(path, owner, error);
    }
    Ok(())
}

/// Opens or creates a regular file without following a final symlink.
/// `O_NONBLOCK` keeps a planted FIFO from blocking the open.
fn open_marker(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .custom_flags((OFlag::O_NOFOLLOW | OFlag::O_NONBLOCK).bits())
        .open(path)?;
    if !file.metadata()?.is_file() {
        return Err(io::Error::other(format!("{} is not a regular file", path.display())));
    }
    Ok(file)
}

fn create_owned_dirs(dir: &Path, stop_at: &Path, owner: &Owner) -> io::Result<()> {
    if let Some(base) = stop_at.parent() {
        fs::create_dir_all(base)?;
    }
    let relative = dir
        .strip_prefix(stop_at)
        .map_err(|_| io::Error::other(format!("{} is outside {}", dir.display(), stop_at.display())))?;

    let mut current = stop_at.to_path_buf();
    ensure_real_dir(&current)?;
    chown_entry(&current, owner);
    for component in relative.components() {
        current.push(component);
        ensure_real_dir(&current)?;
        chown_entry(&current, owner);
    }
    Ok(())
}

fn ensure_real_dir(dir: &Path) -> io::Result<()> {
    match fs::create_dir(dir) {
        Ok(()) => return Ok(()),
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {}
        Err(error) => return Err(error),
    }
    if fs::symlink_metadata(dir)?.file_type().is_dir() {
        Ok(())
    } else {
        Err(io::Error::other(format!("{} is not a directory", dir.display())))
    }
}

fn chown_entry(path: &Path, owner: &Owner) {
    if let Err(error) = fchownat(
        None,
        path,
        Some(owner.uid),
        Some(owner.gid),
        AtFlags::AT_SYMLINK_NOFOLLOW,
    ) {
        warn_chown(path, owner, error);
    }
}

fn warn_chown(path: &Path, owner: &Owner, error: Errno) {
    tracing::warn!(
        %error,
        path = %path.display(),
        user = %owner.name,
        "failed to hand run state to unit owner"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use anyhow::Result;
    use nix::unistd::{Gid, Uid};
    use tempfile::TempDir;

    use crate::{
        layout::UnitPlacement,
        runnable::{RunnableConfig, RunnableKind, UnitTarget},
    };

    fn addon(run_dir: PathBuf) -> Runnable {
        Runnable {
            id: PathBuf::from("/u/addons/proxy/proxy.start"),
            name: "proxy".to_string(),
            kind: RunnableKind::Addon,
            start_path: PathBuf::from("/u/addons/proxy/proxy.start"),
            stop_path: None,
            config_path: None,
            modified: None,
            run_dir,
            config: RunnableConfig::default(),
        }
    }

    #[test]
    fn increments_are_monotonic() -> Result<()> {
        let dir = TempDir::new()?;
        let runnable = addon(dir.path().join("run/addons/proxy"));

        assert_eq!(current(&runnable, Phase::Start), 0);
        for expected in 1..=4 {
            assert_eq!(increment(&runnable, Phase::Start)?, expected);
        }
        assert_eq!(current(&runnable, Phase::Start), 4);
        assert_eq!(current(&runnable, Phase::Stop), 0);

        increment(&runnable, Phase::Stop)?;
        assert_eq!(current(&runnable, Phase::Stop), 1);
        assert_eq!(current(&runnable, Phase::Start), 4);
        Ok(())
    }

    #[test]
    fn highest_suffix_wins_over_gaps() -> Result<()> {
        let dir = TempDir::new()?;
        let runnable = addon(dir.path().to_path_buf());
        for name in ["proxy.start.2", "proxy.start.11", "proxy.start.3", "proxy.start.x"] {
            fs::write(dir.path().join(name), b"")?;
        }
        assert_eq!(current(&runnable, Phase::Start), 11);
        assert_eq!(increment(&runnable, Phase::Start)?, 12);
        Ok(())
    }

    #[test]
    fn reset_only_removes_markers() -> Result<()> {
        let dir = TempDir::new()?;
        let runnable = addon(dir.path().to_path_buf());
        increment(&runnable, Phase::Start)?;
        increment(&runnable, Phase::Start)?;
        increment(&runnable, Phase::Stop)?;
        fs::write(dir.path().join("proxy.origin.dummy"), b"")?;
        fs::write(dir.path().join("proxy.kill"), b"")?;
        fs::write(dir.path().join("other.start.1"), b"")?;

        assert_eq!(reset(&runnable)?, 3);
        assert_eq!(current(&runnable, Phase::Start), 0);
        assert_eq!(current(&runnable, Phase::Stop), 0);
        assert!(dir.path().join("proxy.origin.dummy").exists());
        assert!(dir.path().join("proxy.kill").exists());
        assert!(dir.path().join("other.start.1").exists());

        assert_eq!(increment(&runnable, Phase::Start)?, 1);
        Ok(())
    }

    #[test]
    fn reset_without_run_state_is_a_no_op() -> Result<()> {
        let dir = TempDir::new()?;
        let runnable = addon(dir.path().join("missing"));
        assert_eq!(reset(&runnable)?, 0);
        Ok(())
    }

    #[test]
    fn unit_markers_belong_to_the_owner() -> Result<()> {
        use std::os::unix::fs::MetadataExt;

        let dir = TempDir::new()?;
        let uid = Uid::current();
        let gid = Gid::current();
        let run_subtree = dir.path().join("run/me/web");
        let mut runnable = addon(run_subtree.join("api"));
        runnable.kind = RunnableKind::Unit(UnitTarget {
            owner: Owner {
                name: "me".to_string(),
                uid,
                gid,
            },
            placement: UnitPlacement {
                user: "me".to_string(),
                link_path: dir.path().join("units/me/web"),
                run_subtree: run_subtree.clone(),
            },
        });

        increment(&runnable, Phase::Start)?;
        let marker = runnable.run_dir.join("proxy.start.1");
        assert_eq!(fs::metadata(&marker)?.uid(), uid.as_raw());
        assert_eq!(fs::metadata(dir.path().join("run/me"))?.uid(), uid.as_raw());
        Ok(())
    }

    fn me() -> Owner {
        Owner {
            name: "me".to_string(),
            uid: Uid::current(),
            gid: Gid::current(),
        }
    }

    #[test]
    fn planted_symlinks_are_not_followed() -> Result<()> {
        use std::os::unix::fs::symlink;

        let dir = TempDir::new()?;
        let owner = me();
        let stop_at = dir.path().join("run/me");
        let run_dir = stop_at.join("app");
        fs::create_dir_all(&run_dir)?;
        let victim = dir.path().join("victim");
        fs::write(&victim, b"secret")?;

        let planted = run_dir.join("config.json");
        symlink(&victim, &planted)?;
        assert!(touch_owned(&planted, Some(&owner), Some(&stop_at)).is_err());
        assert!(fs::symlink_metadata(&planted)?.file_type().is_symlink());
        assert_eq!(fs::read(&victim)?, b"secret");

        let elsewhere = dir.path().join("elsewhere");
        fs::create_dir_all(&elsewhere)?;
        symlink(&elsewhere, stop_at.join("other"))?;
        let redirected = stop_at.join("other/app.start.1");
        assert!(touch_owned(&redirected, Some(&owner), Some(&stop_at)).is_err());
        assert!(!elsewhere.join("app.start.1").exists());
        Ok(())
    }

    #[test]
    fn existing_regular_marker_is_reused() -> Result<()> {
        let dir = TempDir::new()?;
        let owner = me();
        let stop_at = dir.path().join("run/me");
        let marker = stop_at.join("app/app.origin.dummy");
        touch_owned(&marker, Some(&owner), Some(&stop_at))?;
        touch_owned(&marker, Some(&owner), Some(&stop_at))?;
        assert!(fs::symlink_metadata(&marker)?.is_file());

        fs::create_dir_all(stop_at.join("app/app.kill"))?;
        assert!(touch_owned(&stop_at.join("app/app.kill"), Some(&owner), Some(&stop_at)).is_err());
        Ok(())
    }
}
