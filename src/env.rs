use std::collections::HashMap;

use crate::runnable::{PhaseConfig, Runnable};

/// Kind of the supervised process: `addon`, `origin` or `unit`.
pub const PROCESS_TYPE_VAR: &str = "HOSTVISOR_PROCESS_TYPE";
/// Owning account, `root` for addons and origins.
pub const PROCESS_USER_VAR: &str = "HOSTVISOR_PROCESS_USER";
/// Runnable name, the directory holding its start script.
pub const PROCESS_NAME_VAR: &str = "HOSTVISOR_PROCESS_NAME";
/// Tells the configuration resolver which phase it is resolving for.
pub const STATE_START_VAR: &str = "HOSTVISOR_STATE_START";

/// Tags external tooling uses to find supervised processes without pid files.
pub fn process_tags(runnable: &Runnable) -> HashMap<String, String> {
    HashMap::from([
        (
            PROCESS_TYPE_VAR.to_string(),
            runnable.kind.process_type().to_string(),
        ),
        (
            PROCESS_USER_VAR.to_string(),
            runnable.kind.process_user().to_string(),
        ),
        (PROCESS_NAME_VAR.to_string(), runnable.name.clone()),
    ])
}

/// Variables layered over the inherited environment. The process tags
/// always win over resolved overrides.
pub fn build_environment(runnable: &Runnable, config: &PhaseConfig) -> HashMap<String, String> {
    let mut env = HashMap::with_capacity(config.envs.len() + 3);
    env.extend(
        config
            .envs
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    env.extend(process_tags(runnable));
    env
}
