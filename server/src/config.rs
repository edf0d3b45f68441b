//! Server configuration file
//!
//! The document only describes *what* to build; type-specific settings stay
//! as raw YAML until the [`Registry`](crate::Registry) hands them to the
//! constructor registered for the entry's `type`.

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:2326";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_TASK_RESPONSES: usize = 64;

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 2326))
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_max_task_responses() -> usize {
    DEFAULT_MAX_TASK_RESPONSES
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_task_responses")]
    pub max_task_responses: usize,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

/// A named backend; `settings` holds every field besides `name` and `type`
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub settings: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    pub name: String,
    #[serde(default)]
    pub verify: Vec<ProbeConfig>,
    #[serde(default)]
    pub produce: Vec<ProducerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub settings: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub settings: BTreeMap<String, serde_yaml::Value>,
}

/// Re-pack flattened settings into the mapping a constructor deserializes
pub(crate) fn settings_value(settings: &BTreeMap<String, serde_yaml::Value>) -> serde_yaml::Value {
    serde_yaml::Value::Mapping(
        settings
            .iter()
            .map(|(k, v)| (serde_yaml::Value::String(k.clone()), v.clone()))
            .collect(),
    )
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(text)?;
        if config.max_task_responses == 0 {
            return Err(ConfigError::rejected(
                "max_task_responses",
                "must be at least 1",
            ));
        }
        if config.request_timeout_secs == 0 {
            return Err(ConfigError::rejected(
                "request_timeout_secs",
                "must be at least 1",
            ));
        }
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
