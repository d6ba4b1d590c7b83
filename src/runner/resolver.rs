use std::{
    fmt,
    fs::{self, OpenOptions},
    io::{self, Read},
    os::unix::{fs::OpenOptionsExt, process::CommandExt},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use nix::fcntl::OFlag;
use thiserror::Error;

use crate::{
    env::STATE_START_VAR,
    layout::RESOLVED_CONFIG_FILE,
    runnable::{Phase, Runnable, RunnableConfig},
};

use super::{ledger, reaper::ChildRegistry};

/// Turns a runnable's configuration source into a typed configuration.
pub trait ConfigResolver: Send + Sync + fmt::Debug {
    fn resolve(&self, runnable: &Runnable, phase: Phase) -> Result<RunnableConfig, ResolveError>;
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("config source {path} has no usable module name")]
    InvalidSource { path: PathBuf },
    #[error("failed to prepare run directory {path}: {source}")]
    RunDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to run resolver {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("resolver exited with {status} for {path}: {stderr}")]
    Failed {
        path: PathBuf,
        status: String,
        stderr: String,
    },
    #[error("failed to read resolved config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode resolved config {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Runs the configuration source through an external interpreter which
/// imports it and dumps its `conf` object as JSON into the run directory.
#[derive(Debug, Clone)]
pub struct CommandResolver {
    program: String,
    children: ChildRegistry,
}

impl CommandResolver {
    pub fn new(program: impl Into<String>, children: ChildRegistry) -> Self {
        Self {
            program: program.into(),
            children,
        }
    }

    fn command(&self, runnable: &Runnable, phase: Phase, snippet: String) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-c")
            .arg(snippet)
            .env(STATE_START_VAR, (phase == Phase::Start).to_string())
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(owner) = runnable.owner() {
            command.uid(owner.uid.as_raw()).gid(owner.gid.as_raw());
        }
        command
    }
}

impl ConfigResolver for CommandResolver {
    fn resolve(&self, runnable: &Runnable, phase: Phase) -> Result<RunnableConfig, ResolveError> {
        let Some(source) = runnable.config_path.as_deref() else {
            return Ok(RunnableConfig::default());
        };
        let output_path = runnable.run_dir.join(RESOLVED_CONFIG_FILE);
        let snippet = resolver_snippet(source, &output_path)?;

        let stop_at = runnable
            .unit()
            .and_then(|unit| unit.placement.run_subtree.parent());
        prepare_run_dir(&runnable.run_dir, runnable, stop_at)?;

        let mut command = self.command(runnable, phase, snippet);
        let child = self
            .children
            .spawn_std(&mut command)
            .map_err(|source| ResolveError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let pid = child.id();
        let output = child.wait_with_output();
        self.children.release(pid);
        let output = output.map_err(|source| ResolveError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(ResolveError::Failed {
                path: source.to_path_buf(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let raw = read_output(&output_path).map_err(|source| ResolveError::Read {
            path: output_path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ResolveError::Decode {
            path: output_path,
            source,
        })
    }
}

/// Resolves the configuration, falling back to an empty one so a broken
/// configuration source never blocks the runnable itself.
pub fn resolve_or_default(
    resolver: &dyn ConfigResolver,
    runnable: &Runnable,
    phase: Phase,
) -> RunnableConfig {
    match resolver.resolve(runnable, phase) {
        Ok(config) => config,
        Err(error) => {
            tracing::warn!(
                %error,
                runnable = %runnable.name,
                %phase,
                "config resolution failed; using empty config"
            );
            RunnableConfig::default()
        }
    }
}

fn prepare_run_dir(
    run_dir: &Path,
    runnable: &Runnable,
    stop_at: Option<&Path>,
) -> Result<(), ResolveError> {
    let map_err = |source| ResolveError::RunDir {
        path: run_dir.to_path_buf(),
        source,
    };
    if runnable.owner().is_none() {
        return fs::create_dir_all(run_dir).map_err(map_err);
    }
    // The resolver runs as the owner and must be able to write its output.
    let output = run_dir.join(RESOLVED_CONFIG_FILE);
    ledger::touch_owned(&output, runnable.owner(), stop_at).map_err(map_err)
}

/// The output file lives in a directory the unit owner controls.
fn read_output(path: &Path) -> io::Result<String> {
    let mut file = OpenOptions::new()
        .read(true)
        .custom_flags((OFlag::O_NOFOLLOW | OFlag::O_NONBLOCK).bits())
        .open(path)?;
    let mut raw = String::new();
    file.read_to_string(&mut raw)?;
    Ok(raw)
}

fn resolver_snippet(source: &Path, output: &Path) -> Result<String, ResolveError> {
    let invalid = || ResolveError::InvalidSource {
        path: source.to_path_buf(),
    };
    let module = source
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(invalid)?;
    let search_dir = source.parent().and_then(Path::to_str).ok_or_else(invalid)?;
    let output = output.to_str().ok_or_else(invalid)?;

    let quote = |value: &str| serde_json::to_string(value).map_err(|_| invalid());
    Ok(format!(
        "import importlib, json, sys\n\
         sys.path.insert(0, {dir})\n\
         conf = importlib.import_module({module}).conf\n\
         with open({out}, \"w\") as handle:\n    json.dump(conf, handle)\n",
        dir = quote(search_dir)?,
        module = quote(module)?,
        out = quote(output)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    use anyhow::Result;
    use serial_test::serial;
    use tempfile::TempDir;

    use crate::runnable::RunnableKind;

    /// Stand-in interpreter: ignores the snippet and writes canned JSON,
    /// echoing the phase flag it was given.
    fn fake_interpreter(dir: &Path, output: &Path) -> Result<PathBuf> {
        let path = dir.join("fake-python");
        let script = format!(
            "#!/bin/sh\nprintf '{{\"start\":{{\"restartCount\":2,\"envs\":{{\"STATE\":\"%s\"}}}}}}' \"${STATE_START_VAR}\" > '{}'\n",
            output.display()
        );
        fs::write(&path, script)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    fn runnable(root: &Path, with_source: bool) -> Result<Runnable> {
        let dir = root.join("units/addons/web");
        fs::create_dir_all(&dir)?;
        let config_path = dir.join("config.py");
        if with_source {
            fs::write(&config_path, "conf = {}\n")?;
        }
        Ok(Runnable {
            id: dir.join("web.start"),
            name: "web".to_string(),
            kind: RunnableKind::Addon,
            start_path: dir.join("web.start"),
            stop_path: None,
            config_path: with_source.then_some(config_path),
            modified: None,
            run_dir: root.join("run/addons/web"),
            config: RunnableConfig::default(),
        })
    }

    #[test]
    fn missing_source_yields_default() -> Result<()> {
        let dir = TempDir::new()?;
        let runnable = runnable(dir.path(), false)?;
        let resolver = CommandResolver::new("/nonexistent/python", ChildRegistry::new());
        assert_eq!(
            resolver.resolve(&runnable, Phase::Start)?,
            RunnableConfig::default()
        );
        Ok(())
    }

    #[test]
    #[serial]
    fn decodes_interpreter_output() -> Result<()> {
        let dir = TempDir::new()?;
        let runnable = runnable(dir.path(), true)?;
        let output = runnable.run_dir.join(RESOLVED_CONFIG_FILE);
        let program = fake_interpreter(dir.path(), &output)?;
        let children = ChildRegistry::new();
        let resolver = CommandResolver::new(program.to_string_lossy(), children.clone());

        let config = resolver.resolve(&runnable, Phase::Start)?;
        assert_eq!(config.start.restart_count, 2);
        assert_eq!(config.start.envs.get("STATE").map(String::as_str), Some("true"));

        let config = resolver.resolve(&runnable, Phase::Stop)?;
        assert_eq!(config.start.envs.get("STATE").map(String::as_str), Some("false"));
        Ok(())
    }

    #[test]
    #[serial]
    fn failures_fall_back_to_empty_config() -> Result<()> {
        let dir = TempDir::new()?;
        let runnable = runnable(dir.path(), true)?;
        let resolver = CommandResolver::new("false", ChildRegistry::new());

        let err = resolver.resolve(&runnable, Phase::Start).unwrap_err();
        assert!(matches!(err, ResolveError::Failed { .. }), "{err}");
        assert_eq!(
            resolve_or_default(&resolver, &runnable, Phase::Start),
            RunnableConfig::default()
        );
        Ok(())
    }

    #[test]
    fn unit_output_symlink_is_refused() -> Result<()> {
        use std::os::unix::fs::symlink;

        use nix::unistd::{Gid, Uid};

        use crate::{
            layout::UnitPlacement,
            runnable::{Owner, UnitTarget},
        };

        let dir = TempDir::new()?;
        let mut runnable = runnable(dir.path(), true)?;
        let run_subtree = dir.path().join("run/me/web");
        runnable.kind = RunnableKind::Unit(UnitTarget {
            owner: Owner {
                name: "me".to_string(),
                uid: Uid::current(),
                gid: Gid::current(),
            },
            placement: UnitPlacement {
                user: "me".to_string(),
                link_path: dir.path().join("units/me/web"),
                run_subtree: run_subtree.clone(),
            },
        });
        runnable.run_dir = run_subtree.clone();
        fs::create_dir_all(&run_subtree)?;
        let victim = dir.path().join("victim");
        fs::write(&victim, b"{}")?;
        symlink(&victim, run_subtree.join(RESOLVED_CONFIG_FILE))?;

        let resolver = CommandResolver::new("/nonexistent/python", ChildRegistry::new());
        let err = resolver.resolve(&runnable, Phase::Start).unwrap_err();
        assert!(matches!(err, ResolveError::RunDir { .. }), "{err}");
        assert!(fs::symlink_metadata(run_subtree.join(RESOLVED_CONFIG_FILE))?.file_type().is_symlink());
        assert_eq!(fs::read(&victim)?, b"{}");
        Ok(())
    }

    #[test]
    fn output_symlink_is_not_read() -> Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("target.json");
        fs::write(&target, b"{}")?;
        let link = dir.path().join("config.json");
        std::os::unix::fs::symlink(&target, &link)?;
        assert!(read_output(&link).is_err());
        assert_eq!(read_output(&target)?, "{}");
        Ok(())
    }

    #[test]
    fn snippet_quotes_paths() -> Result<()> {
        let snippet = resolver_snippet(
            Path::new("/srv/it's \"odd\"/config.py"),
            Path::new("/run/web/config.json"),
        )?;
        assert!(snippet.contains(r#"sys.path.insert(0, "/srv/it's \"odd\"")"#));
        assert!(snippet.contains(r#"importlib.import_module("config")"#));
        assert!(snippet.contains(r#"open("/run/web/config.json", "w")"#));
        Ok(())
    }
}
