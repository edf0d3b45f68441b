//! Type-name to constructor tables
//!
//! Every configurable kind of backend, producer and probe is looked up here
//! by its `type` string. The registry is assembled once at startup and only
//! read afterwards.

use crate::backend::{self, Backends, X509Backend};
use crate::config::{settings_value, BackendConfig, PolicyConfig};
use crate::error::ConfigError;
use crate::harvest::Policy;
use crate::probe::{self, Probe};
use crate::producer::{file, pki, Producer};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub type BackendCtor = fn(&str, serde_yaml::Value) -> Result<Arc<dyn X509Backend>, ConfigError>;
pub type ProducerCtor = fn(&str, serde_yaml::Value) -> Result<Box<dyn Producer>, ConfigError>;
pub type ProbeCtor = fn(&str, serde_yaml::Value) -> Result<Box<dyn Probe>, ConfigError>;

pub struct Registry {
    backends: HashMap<&'static str, BackendCtor>,
    producers: HashMap<&'static str, ProducerCtor>,
    probes: HashMap<&'static str, ProbeCtor>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            backends: HashMap::new(),
            producers: HashMap::new(),
            probes: HashMap::new(),
        }
    }

    /// Everything this build ships with
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register_backend("x509_file", backend::x509_file);
        registry.register_producer("x509", pki::new);
        registry.register_producer("file", file::new);
        registry.register_probe("match", probe::match_probe);
        registry
    }

    pub fn register_backend(&mut self, kind: &'static str, ctor: BackendCtor) {
        self.backends.insert(kind, ctor);
    }

    pub fn register_producer(&mut self, kind: &'static str, ctor: ProducerCtor) {
        self.producers.insert(kind, ctor);
    }

    pub fn register_probe(&mut self, kind: &'static str, ctor: ProbeCtor) {
        self.probes.insert(kind, ctor);
    }

    pub fn build_backends(&self, configs: &[BackendConfig]) -> Result<Backends, ConfigError> {
        let mut backends = Backends::new();
        for config in configs {
            let ctor = self.backends.get(config.kind.as_str()).ok_or_else(|| {
                ConfigError::UnknownBackendType {
                    kind: config.kind.clone(),
                    name: config.name.clone(),
                }
            })?;
            let backend = ctor(&config.name, settings_value(&config.settings))?;
            backends.insert_x509(config.name.clone(), backend)?;
            debug!(backend = %config.name, kind = %config.kind, "Backend registered");
        }
        Ok(backends)
    }

    pub fn build_policy(&self, config: &PolicyConfig) -> Result<Policy, ConfigError> {
        let mut probes = Vec::with_capacity(config.verify.len());
        for probe in &config.verify {
            let ctor = self.probes.get(probe.kind.as_str()).ok_or_else(|| {
                ConfigError::UnknownProbeType {
                    kind: probe.kind.clone(),
                    policy: config.name.clone(),
                }
            })?;
            probes.push(ctor(&config.name, settings_value(&probe.settings))?);
        }

        let mut producers = Vec::with_capacity(config.produce.len());
        for producer in &config.produce {
            let ctor = self.producers.get(producer.kind.as_str()).ok_or_else(|| {
                ConfigError::UnknownProducerType {
                    kind: producer.kind.clone(),
                    name: producer.name.clone(),
                }
            })?;
            producers.push(ctor(&producer.name, settings_value(&producer.settings))?);
        }

        Policy::new(config.name.clone(), probes, producers)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testutil::write_ca;

    #[test]
    fn builds_standard_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let ca = write_ca(dir.path(), "Test CA");
        let yaml = format!(
            r#"
backends:
  - {{name: ca1, type: x509_file, key: '{}', cert: '{}'}}
policies:
  - name: web
    verify:
      - {{type: match, value: '${{req.fqdn}}', suffix: .example.com}}
    produce:
      - {{name: web, type: x509, backend: ca1, common_name: svc.example.com}}
      - {{name: motd, type: file, content: hello}}
"#,
            ca.key_path.display(),
            ca.cert_path.display()
        );
        let config = Config::from_yaml(&yaml).unwrap();
        let registry = Registry::standard();

        let backends = registry.build_backends(&config.backends).unwrap();
        assert_eq!(backends.x509_names().collect::<Vec<_>>(), vec!["ca1"]);

        let policy = registry.build_policy(&config.policies[0]).unwrap();
        assert_eq!(policy.name(), "web");
        assert_eq!(policy.producer_names().collect::<Vec<_>>(), vec!["web", "motd"]);
    }

    #[test]
    fn unknown_types_are_fatal() {
        let config = Config::from_yaml(
            r#"
backends:
  - {name: vault, type: vault}
policies:
  - name: a
    produce:
      - {name: p, type: ssh}
  - name: b
    verify:
      - {type: dns}
"#,
        )
        .unwrap();
        let registry = Registry::standard();

        assert!(matches!(
            registry.build_backends(&config.backends),
            Err(ConfigError::UnknownBackendType { kind, .. }) if kind == "vault"
        ));
        assert!(matches!(
            registry.build_policy(&config.policies[0]),
            Err(ConfigError::UnknownProducerType { kind, .. }) if kind == "ssh"
        ));
        assert!(matches!(
            registry.build_policy(&config.policies[1]),
            Err(ConfigError::UnknownProbeType { kind, .. }) if kind == "dns"
        ));
    }

    #[test]
    fn empty_registry_knows_nothing() {
        let config = Config::from_yaml(
            "policies: [{name: a, produce: [{name: p, type: file, content: x}]}]",
        )
        .unwrap();
        assert!(Registry::empty().build_policy(&config.policies[0]).is_err());
    }
}
