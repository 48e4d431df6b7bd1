use std::path::Path;

use anyhow::{Context, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::projection::DEFAULT_FREIGHT_SHORT_LEN;

const ENV_PAGE_SIZE: &str = "STAGEWATCH_PAGE_SIZE";
const ENV_WATCH_CHANNEL_CAPACITY: &str = "STAGEWATCH_WATCH_CHANNEL_CAPACITY";
const ENV_ARGOCD_SHARD_URL: &str = "STAGEWATCH_ARGOCD_SHARD_URL";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct WatchConfig {
    /// Buffered watch events per subscription before the transport blocks.
    #[serde(default = "default_channel_capacity")]
    #[schemars(range(min = 1))]
    pub channel_capacity: usize,
    /// Capacity of the engine notification bus.
    #[serde(default = "default_bus_capacity")]
    #[schemars(range(min = 1))]
    pub bus_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ViewConfig {
    /// Rows per page; pagination controls are hidden when everything fits.
    #[serde(default = "default_page_size")]
    #[schemars(range(min = 1))]
    pub page_size: usize,
    #[serde(default = "default_freight_short_len")]
    #[schemars(range(min = 1))]
    pub freight_short_len: usize,
    /// Base URL handed to deep-link renderers, e.g. <https://argocd.example.com>
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argocd_shard_url: Option<String>,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            freight_short_len: default_freight_short_len(),
            argocd_shard_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub view: ViewConfig,
}

fn default_channel_capacity() -> usize {
    64
}

fn default_bus_capacity() -> usize {
    256
}

fn default_page_size() -> usize {
    10
}

fn default_freight_short_len() -> usize {
    DEFAULT_FREIGHT_SHORT_LEN
}

static CONFIG_SCHEMA: Lazy<Option<Validator>> = Lazy::new(|| {
    let schema_value = config_schema_json();
    match validator_for(&schema_value) {
        Ok(v) => Some(v),
        Err(err) => {
            warn!(error = %err, "config schema failed to compile; skipping validation");
            None
        }
    }
});

/// JSON schema describing the configuration file.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).unwrap_or(serde_json::Value::Null)
}

pub fn write_schema_file(path: impl AsRef<Path>) -> std::io::Result<()> {
    let schema_json = config_schema_json();
    std::fs::write(path, serde_json::to_string_pretty(&schema_json)?)
}

/// Read, validate, and decode a TOML config file, then apply `STAGEWATCH_*`
/// environment overrides.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let raw: toml::Value = toml::from_str(&content)?;
    let json_value = serde_json::to_value(&raw)?;
    if let Some(validator) = CONFIG_SCHEMA.as_ref() {
        let validation_errors: Vec<_> = validator
            .iter_errors(&json_value)
            .map(|e| e.to_string())
            .collect();
        if !validation_errors.is_empty() {
            return Err(anyhow::anyhow!(validation_errors.join(", ")));
        }
    }
    let mut cfg: Config = toml::from_str(&content)?;
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

impl Config {
    /// Defaults with environment overrides applied; used when no file is given.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        cfg
    }
}

fn env_usize(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(v) if v > 0 => Some(v),
        _ => {
            warn!(key, value = %raw, "ignoring invalid override");
            None
        }
    }
}

fn apply_env_overrides(cfg: &mut Config) {
    if let Some(v) = env_usize(ENV_PAGE_SIZE) {
        cfg.view.page_size = v;
    }
    if let Some(v) = env_usize(ENV_WATCH_CHANNEL_CAPACITY) {
        cfg.watch.channel_capacity = v;
    }
    if let Ok(url) = std::env::var(ENV_ARGOCD_SHARD_URL) {
        let url = url.trim();
        cfg.view.argocd_shard_url = (!url.is_empty()).then(|| url.to_string());
    }
}
