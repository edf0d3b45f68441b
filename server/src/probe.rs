//! Verification probes
//!
//! A probe decides whether a policy applies to the requesting machine. A
//! [`ProbeError::Rejected`] outcome skips the policy for the round; any other
//! error aborts the round.

use crate::error::{ConfigError, ProbeError};
use crate::expr::{Environment, Expression};
use serde::Deserialize;

pub trait Probe: Send + Sync {
    fn kind(&self) -> &'static str;

    fn test(&self, env: &Environment) -> Result<(), ProbeError>;
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MatchConfig {
    value: Expression,
    #[serde(default)]
    equals: Vec<String>,
    #[serde(default)]
    suffix: Option<String>,
}

/// Compares one string from the environment against accepted values
pub struct MatchProbe {
    value: Expression,
    equals: Vec<String>,
    suffix: Option<String>,
}

impl MatchProbe {
    pub fn new(value: Expression, equals: Vec<String>, suffix: Option<String>) -> Self {
        Self {
            value,
            equals,
            suffix,
        }
    }
}

impl Probe for MatchProbe {
    fn kind(&self) -> &'static str {
        "match"
    }

    fn test(&self, env: &Environment) -> Result<(), ProbeError> {
        let value = self.value.eval_string(env)?;

        if !self.equals.is_empty() && !self.equals.contains(&value) {
            return Err(ProbeError::Rejected(format!(
                "'{}' is not one of {:?}",
                value, self.equals
            )));
        }
        if let Some(suffix) = &self.suffix {
            if !value.ends_with(suffix.as_str()) {
                return Err(ProbeError::Rejected(format!(
                    "'{}' does not end with '{}'",
                    value, suffix
                )));
            }
        }
        Ok(())
    }
}

/// Construct a `match` probe from its configuration block
pub fn match_probe(policy: &str, config: serde_yaml::Value) -> Result<Box<dyn Probe>, ConfigError> {
    let what = format!("match probe in policy '{}'", policy);
    let config: MatchConfig =
        serde_yaml::from_value(config).map_err(|source| ConfigError::Invalid {
            what: what.clone(),
            source,
        })?;
    if config.equals.is_empty() && config.suffix.is_none() {
        return Err(ConfigError::rejected(what, "needs `equals` or `suffix`"));
    }
    Ok(Box::new(MatchProbe::new(
        config.value,
        config.equals,
        config.suffix,
    )))
}
