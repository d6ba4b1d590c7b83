use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("'{field}' must be greater than zero")]
    ZeroDuration { field: &'static str },
    #[error("'termination.escalation_seconds' needs at least one step")]
    EmptyEscalation,
    #[error("unit config name '{value}' must be a plain file name")]
    InvalidUnitConfigName { value: String },
    #[error("resolver program must not be empty")]
    EmptyResolverProgram,
}

pub type ConfigResult<T> = Result<T, ConfigError>;
