//! X.509 issuance over a client-generated key
//!
//! Round one asks the client for an ECDSA key; the private half stays on the
//! machine as `<name>/key.pem`. Once the public half comes back the producer
//! has the named backend sign a certificate over it and delivers
//! `cert.pem`, `chain.pem` and `fullchain.pem`.

use super::{default_mask, validate_mask, Context, Producer};
use crate::backend::{CertificateTemplate, SubjectPublicKey};
use crate::error::{ConfigError, ProducerError};
use crate::expr::Expression;
use ::pem::{EncodeConfig, LineEnding, Pem};
use serde::Deserialize;
use shared::task::{Curve, EcdsaKeyTask, Task, TaskKey, TaskResponse, ECDSA_KEY_TYPE};
use shared::Product;
use std::net::IpAddr;
use tracing::debug;

/// Permission bits of the delivered certificate files
pub const CERT_MASK: u32 = 0o400;

pub const DEFAULT_VALIDITY_DAYS: u32 = 365;

const SERIAL_LEN: usize = 16;

fn default_curve() -> Curve {
    Curve::P521
}

fn default_validity_days() -> u32 {
    DEFAULT_VALIDITY_DAYS
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PkiConfig {
    backend: Expression,
    #[serde(default)]
    common_name: Expression,
    #[serde(default)]
    alt_dns: Expression,
    #[serde(default)]
    alt_ips: Expression,
    #[serde(default = "default_curve")]
    curve: Curve,
    #[serde(default = "default_mask")]
    key_mask: u32,
    #[serde(default = "default_validity_days")]
    validity_days: u32,
}

#[derive(Debug)]
pub struct PkiProducer {
    name: String,
    key: TaskKey,
    backend: Expression,
    common_name: Expression,
    alt_dns: Expression,
    alt_ips: Expression,
    curve: Curve,
    key_mask: u32,
    validity: time::Duration,
}

impl PkiProducer {
    fn product(&self, file: &str, body: Vec<u8>) -> Product {
        Product {
            name: vec![self.name.clone(), file.to_string()],
            mask: CERT_MASK,
            body,
        }
    }

    fn key_task(&self) -> Task {
        Task::EcdsaKey(EcdsaKeyTask {
            curve: self.curve,
            template: Product {
                name: vec![self.name.clone(), "key.pem".to_string()],
                mask: self.key_mask,
                body: Vec::new(),
            },
        })
    }

    /// Public key from the client's answer, checked against what was asked
    fn public_key(&self, response: &TaskResponse) -> Result<SubjectPublicKey, ProducerError> {
        if response.kind() != ECDSA_KEY_TYPE {
            return Err(ProducerError::ResponseType {
                key: self.key.clone(),
                expected: ECDSA_KEY_TYPE,
                found: response.kind(),
            });
        }
        let TaskResponse::EcdsaKey(response) = response;
        if response.curve != self.curve {
            return Err(ProducerError::CurveMismatch {
                key: self.key.clone(),
                expected: self.curve,
                found: response.curve,
            });
        }
        Ok(SubjectPublicKey::from_response(response)?)
    }
}

impl Producer for PkiProducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "x509"
    }

    fn prepare(&self, ctx: &Context<'_>) -> Result<Vec<(TaskKey, Task)>, ProducerError> {
        match ctx.responses.get(&self.key) {
            Some(response) => {
                self.public_key(response)?;
                Ok(Vec::new())
            }
            None => Ok(vec![(self.key.clone(), self.key_task())]),
        }
    }

    fn produce(&self, ctx: &Context<'_>) -> Result<Vec<Product>, ProducerError> {
        let backend_name = self.backend.eval_string(ctx.env)?;
        let backend = ctx
            .backends
            .x509(&backend_name)
            .ok_or_else(|| ProducerError::UnknownBackend(backend_name.clone()))?;

        let common_name = self.common_name.eval_string(ctx.env)?;
        let dns_names = self.alt_dns.eval_list(ctx.env)?;
        let ip_addresses = self
            .alt_ips
            .eval_list(ctx.env)?
            .into_iter()
            .map(|ip| ip.parse::<IpAddr>().map_err(|_| ProducerError::InvalidIp(ip)))
            .collect::<Result<Vec<_>, _>>()?;

        let response = ctx
            .responses
            .get(&self.key)
            .ok_or_else(|| ProducerError::MissingResponse(self.key.clone()))?;
        let public_key = self.public_key(response)?;

        let template = CertificateTemplate {
            common_name,
            dns_names,
            ip_addresses,
            serial: fresh_serial()?,
            public_key,
            validity: self.validity,
        };
        let signed = backend.sign(&template)?;
        debug!(producer = %self.name, backend = %backend_name, "Certificate issued");

        let cert = pem_certificate(&signed.leaf);
        let chain: String = signed.chain.iter().map(|der| pem_certificate(der)).collect();
        let fullchain = format!("{}{}", cert, chain);

        Ok(vec![
            self.product("cert.pem", cert.into_bytes()),
            self.product("chain.pem", chain.into_bytes()),
            self.product("fullchain.pem", fullchain.into_bytes()),
        ])
    }
}

/// Random positive serial number
fn fresh_serial() -> Result<Vec<u8>, ProducerError> {
    let mut serial = vec![0u8; SERIAL_LEN];
    aws_lc_rs::rand::fill(&mut serial).map_err(|_| ProducerError::Serial)?;
    serial[0] &= 0x7f;
    if serial[0] == 0 {
        serial[0] = 0x01;
    }
    Ok(serial)
}

fn pem_certificate(der: &[u8]) -> String {
    ::pem::encode_config(
        &Pem::new("CERTIFICATE", der.to_vec()),
        EncodeConfig::new().set_line_ending(LineEnding::LF),
    )
}

/// Construct an `x509` producer from its configuration block
pub fn new(name: &str, config: serde_yaml::Value) -> Result<Box<dyn Producer>, ConfigError> {
    let what = format!("x509 producer '{}'", name);
    let config: PkiConfig =
        serde_yaml::from_value(config).map_err(|source| ConfigError::Invalid {
            what: what.clone(),
            source,
        })?;

    let key = TaskKey::single(name).map_err(|e| ConfigError::rejected(&what, e.to_string()))?;
    if name == "." || name == ".." || name.contains('/') {
        return Err(ConfigError::rejected(what, "name must be a plain file name"));
    }
    if config.backend.is_null() {
        return Err(ConfigError::rejected(what, "`backend` is required"));
    }
    validate_mask(&what, config.key_mask)?;
    if config.validity_days == 0 {
        return Err(ConfigError::rejected(what, "`validity_days` must be positive"));
    }

    Ok(Box::new(PkiProducer {
        name: name.to_string(),
        key,
        backend: config.backend,
        common_name: config.common_name,
        alt_dns: config.alt_dns,
        alt_ips: config.alt_ips,
        curve: config.curve,
        key_mask: config.key_mask,
        validity: time::Duration::days(i64::from(config.validity_days)),
    }))
}
