use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub root: Option<String>,
    pub addons_source: Option<String>,
    pub poll_interval_seconds: Option<u64>,
    pub unit_config_name: Option<String>,
    pub group: Option<String>,
    #[serde(default)]
    pub resolver: RawResolverConfig,
    #[serde(default)]
    pub termination: RawTerminationConfig,
    #[serde(default)]
    pub reaper: RawReaperConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawResolverConfig {
    pub program: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawTerminationConfig {
    pub escalation_seconds: Option<Vec<u64>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawReaperConfig {
    pub enabled: Option<bool>,
    pub interval_ms: Option<u64>,
}
