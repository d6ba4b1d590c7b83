//! Boot-time preparation of the `.runtime` tree.

use std::{
    fs, io,
    os::unix::fs::symlink,
    path::Path,
};

use anyhow::{Context, Result, bail};

use crate::layout::Layout;

/// Rebuilds the origin snapshots from `addons`, clears the run-state tree
/// and links the addons into the unit tree. Failing to rebuild either tree
/// is fatal; a missing link is only logged.
pub fn prepare(layout: &Layout, addons: &Path) -> Result<()> {
    layout
        .reset_origins_dir()
        .with_context(|| format!("clearing origin snapshots {}", layout.origins_dir().display()))?;
    snapshot_addons(addons, layout.origins_dir()).with_context(|| {
        format!(
            "copying addons from {} to {}",
            addons.display(),
            layout.origins_dir().display()
        )
    })?;
    tracing::info!(
        source = %addons.display(),
        origins = %layout.origins_dir().display(),
        "origin snapshots refreshed"
    );

    layout
        .reset_run_dir()
        .with_context(|| format!("clearing run directory {}", layout.run_dir().display()))?;

    if let Err(error) = layout.ensure_units_dir() {
        tracing::warn!(%error, dir = %layout.units_dir().display(), "failed to create unit directory");
        return Ok(());
    }
    link_addons(layout, addons);
    Ok(())
}

fn snapshot_addons(source: &Path, dest: &Path) -> Result<()> {
    // The source itself may be a symlink into a package directory.
    let metadata = fs::metadata(source)?;
    if !metadata.is_dir() {
        bail!("{} is not a directory", source.display());
    }
    copy_tree(source, dest)?;
    Ok(())
}

/// Recursive copy keeping file modes. Nested symlinks are recreated rather
/// than followed.
fn copy_tree(source: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_symlink() {
            symlink(fs::read_link(&from)?, &to)?;
        } else if file_type.is_file() {
            fs::copy(&from, &to)?;
        } else {
            tracing::debug!(path = %from.display(), "skipping special file in addon tree");
        }
    }
    Ok(())
}

fn link_addons(layout: &Layout, addons: &Path) {
    let link = layout.addons_link();
    match fs::read_link(&link) {
        Ok(target) if target == addons => return,
        Ok(target) => {
            tracing::warn!(
                link = %link.display(),
                target = %target.display(),
                expected = %addons.display(),
                "addon link points elsewhere; leaving it"
            );
            return;
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => {
            tracing::warn!(%error, link = %link.display(), "addon entry is not a symlink; leaving it");
            return;
        }
    }
    match symlink(addons, &link) {
        Ok(()) => tracing::info!(link = %link.display(), target = %addons.display(), "linked addons"),
        Err(error) => tracing::warn!(%error, link = %link.display(), "failed to link addons"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    fn addon_tree(root: &Path) -> Result<()> {
        let proxy = root.join("proxy");
        fs::create_dir_all(proxy.join("lib"))?;
        fs::write(proxy.join("proxy.start"), "#!/bin/sh\nexit 0\n")?;
        fs::set_permissions(proxy.join("proxy.start"), fs::Permissions::from_mode(0o755))?;
        fs::write(proxy.join("lib/helpers.sh"), "true\n")?;
        symlink("lib/helpers.sh", proxy.join("helpers"))?;
        Ok(())
    }

    #[test]
    fn boot_refreshes_origins_and_run_state() -> Result<()> {
        let dir = TempDir::new()?;
        let layout = Layout::new(dir.path());
        let addons = layout.default_addons_source();
        addon_tree(&addons)?;
        fs::create_dir_all(layout.origins_dir().join("stale"))?;
        fs::create_dir_all(layout.run_dir().join("addons/proxy"))?;
        fs::write(layout.run_dir().join("addons/proxy/proxy.start.3"), b"")?;

        prepare(&layout, &addons)?;

        let origin = layout.origins_dir().join("proxy");
        assert!(!layout.origins_dir().join("stale").exists());
        let mode = fs::metadata(origin.join("proxy.start"))?.permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        assert_eq!(fs::read_to_string(origin.join("lib/helpers.sh"))?, "true\n");
        assert_eq!(fs::read_link(origin.join("helpers"))?, Path::new("lib/helpers.sh"));
        assert_eq!(fs::read_dir(layout.run_dir())?.count(), 0);
        assert_eq!(fs::read_link(layout.addons_link())?, addons);

        // Later edits to the addon never reach the snapshot.
        fs::write(addons.join("proxy/proxy.start"), "#!/bin/sh\nexit 1\n")?;
        assert_eq!(
            fs::read_to_string(origin.join("proxy.start"))?,
            "#!/bin/sh\nexit 0\n"
        );

        prepare(&layout, &addons)?;
        assert_eq!(
            fs::read_to_string(origin.join("proxy.start"))?,
            "#!/bin/sh\nexit 1\n"
        );
        Ok(())
    }

    #[test]
    fn missing_addon_source_is_fatal() -> Result<()> {
        let dir = TempDir::new()?;
        let layout = Layout::new(dir.path());
        let err = prepare(&layout, &dir.path().join("no-addons")).unwrap_err();
        assert!(format!("{err:#}").contains("copying addons"), "{err:#}");
        Ok(())
    }

    #[test]
    fn foreign_addon_entry_is_left_alone() -> Result<()> {
        let dir = TempDir::new()?;
        let layout = Layout::new(dir.path());
        let addons = layout.default_addons_source();
        addon_tree(&addons)?;
        fs::create_dir_all(layout.addons_link())?;

        prepare(&layout, &addons)?;
        assert!(fs::symlink_metadata(layout.addons_link())?.is_dir());
        Ok(())
    }
}
