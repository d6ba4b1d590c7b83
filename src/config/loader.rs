use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use super::{
    error::{ConfigError, ConfigResult},
    model::{ReaperConfig, ResolverConfig, SupervisorConfig, TerminationConfig},
    raw::{RawConfig, RawReaperConfig, RawResolverConfig, RawTerminationConfig},
};

pub fn load_from_path<P: AsRef<Path>>(path: P) -> ConfigResult<SupervisorConfig> {
    let path_ref = path.as_ref();
    let raw_contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::ReadFailure {
        path: path_ref.to_path_buf(),
        source,
    })?;
    load_from_str(path_ref, &raw_contents)
}

pub fn load_from_str(config_path: &Path, contents: &str) -> ConfigResult<SupervisorConfig> {
    let raw: RawConfig = toml::from_str(contents)?;
    convert_raw_config(config_path, raw)
}

fn convert_raw_config(config_path: &Path, raw: RawConfig) -> ConfigResult<SupervisorConfig> {
    let defaults = SupervisorConfig::default();

    let root = raw
        .root
        .map(|value| resolve_relative_path(config_path, value))
        .unwrap_or(defaults.root);
    let addons_source = raw
        .addons_source
        .map(|value| resolve_relative_path(config_path, value));

    let poll_interval = match raw.poll_interval_seconds {
        Some(0) => {
            return Err(ConfigError::ZeroDuration {
                field: "poll_interval_seconds",
            });
        }
        Some(seconds) => Duration::from_secs(seconds),
        None => defaults.poll_interval,
    };

    let unit_config_name = match raw.unit_config_name {
        Some(value) => validate_unit_config_name(value)?,
        None => defaults.unit_config_name,
    };

    let group = match raw.group {
        Some(value) => normalize_group(value),
        None => defaults.group,
    };

    Ok(SupervisorConfig {
        root,
        addons_source,
        poll_interval,
        unit_config_name,
        group,
        resolver: convert_resolver_config(raw.resolver)?,
        restart: defaults.restart,
        termination: convert_termination_config(raw.termination)?,
        reaper: convert_reaper_config(raw.reaper)?,
    })
}

fn convert_resolver_config(raw: RawResolverConfig) -> ConfigResult<ResolverConfig> {
    match raw.program {
        Some(program) if program.trim().is_empty() => Err(ConfigError::EmptyResolverProgram),
        Some(program) => Ok(ResolverConfig { program }),
        None => Ok(ResolverConfig::default()),
    }
}

fn convert_termination_config(raw: RawTerminationConfig) -> ConfigResult<TerminationConfig> {
    let Some(steps) = raw.escalation_seconds else {
        return Ok(TerminationConfig::default());
    };
    if steps.is_empty() {
        return Err(ConfigError::EmptyEscalation);
    }
    Ok(TerminationConfig {
        escalation: steps.into_iter().map(Duration::from_secs).collect(),
    })
}

fn convert_reaper_config(raw: RawReaperConfig) -> ConfigResult<ReaperConfig> {
    let defaults = ReaperConfig::default();
    let interval = match raw.interval_ms {
        Some(0) => {
            return Err(ConfigError::ZeroDuration {
                field: "reaper.interval_ms",
            });
        }
        Some(ms) => Duration::from_millis(ms),
        None => defaults.interval,
    };
    Ok(ReaperConfig {
        enabled: raw.enabled.unwrap_or(defaults.enabled),
        interval,
    })
}

pub fn validate_unit_config_name(value: String) -> ConfigResult<String> {
    let plain = !value.is_empty()
        && !value.contains('/')
        && value != "."
        && value != ".."
        && value.ends_with(".py");
    if plain {
        Ok(value)
    } else {
        Err(ConfigError::InvalidUnitConfigName { value })
    }
}

/// An empty group name disables the shared group credential.
pub fn normalize_group(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn resolve_relative_path(config_path: &Path, value: String) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        return path;
    }
    let base_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    base_dir.join(path)
}
