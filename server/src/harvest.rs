//! Harvest rounds
//!
//! [`Harvester::run`] answers one request. Rounds keep no server-side state:
//! whatever the producers need from earlier rounds comes back from the client
//! as task responses.

use crate::backend::Backends;
use crate::config::Config;
use crate::error::{ConfigError, HarvestError, HarvestResult, ProbeError};
use crate::expr::Environment;
use crate::probe::Probe;
use crate::producer::{Context, Producer, TaskResponses};
use crate::registry::Registry;
use shared::task::TaskCodec;
use shared::{ErrorEntry, Product, Request, Response, WireTask, PROTOCOL_VERSION};
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::{debug, info, info_span, warn};

const COOKIE_LEN: usize = 16;

/// Probes gating an ordered list of producers
pub struct Policy {
    name: String,
    probes: Vec<Box<dyn Probe>>,
    producers: Vec<Box<dyn Producer>>,
}

impl Policy {
    pub fn new(
        name: impl Into<String>,
        probes: Vec<Box<dyn Probe>>,
        producers: Vec<Box<dyn Producer>>,
    ) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for producer in &producers {
            if !seen.insert(producer.name()) {
                return Err(ConfigError::DuplicateProducer(producer.name().to_string()));
            }
        }
        Ok(Self {
            name: name.into(),
            probes,
            producers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn producer_names(&self) -> impl Iterator<Item = &str> {
        self.producers.iter().map(|p| p.name())
    }

    /// Whether the policy applies; a rejecting probe is not an error
    fn verify(&self, env: &Environment) -> HarvestResult<bool> {
        for probe in &self.probes {
            match probe.test(env) {
                Ok(()) => {}
                Err(ProbeError::Rejected(reason)) => {
                    debug!(policy = %self.name, probe = probe.kind(), %reason, "Policy skipped");
                    return Ok(false);
                }
                Err(source) => {
                    return Err(HarvestError::Probe {
                        policy: self.name.clone(),
                        source,
                    })
                }
            }
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Requests carrying more task responses are refused
    pub max_task_responses: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_task_responses: crate::config::DEFAULT_MAX_TASK_RESPONSES,
        }
    }
}

/// Result of a successful round
#[derive(Debug, PartialEq)]
pub enum Outcome {
    /// The client has work to do before anything can be produced
    Tasks(Vec<WireTask>),
    Products(Vec<Product>),
}

pub struct Harvester {
    policies: Vec<Policy>,
    backends: Backends,
    codec: TaskCodec,
    limits: Limits,
}

impl Harvester {
    /// Policy names and producer names must each be unique across the
    /// whole configuration; producer names double as correlation keys.
    pub fn new(
        policies: Vec<Policy>,
        backends: Backends,
        codec: TaskCodec,
        limits: Limits,
    ) -> Result<Self, ConfigError> {
        let mut policy_names = HashSet::new();
        let mut producer_names = HashSet::new();
        for policy in &policies {
            if !policy_names.insert(policy.name()) {
                return Err(ConfigError::DuplicatePolicy(policy.name().to_string()));
            }
            for name in policy.producer_names() {
                if !producer_names.insert(name) {
                    return Err(ConfigError::DuplicateProducer(name.to_string()));
                }
            }
        }

        Ok(Self {
            policies,
            backends,
            codec,
            limits,
        })
    }

    pub fn from_config(config: &Config, registry: &Registry) -> Result<Self, ConfigError> {
        let backends = registry.build_backends(&config.backends)?;
        let policies = config
            .policies
            .iter()
            .map(|p| registry.build_policy(p))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            backends = backends.len(),
            policies = policies.len(),
            "Harvester configured"
        );

        Self::new(
            policies,
            backends,
            TaskCodec::standard(),
            Limits {
                max_task_responses: config.max_task_responses,
            },
        )
    }

    /// Answer one request; failures become a single wire error
    pub fn run(&self, request: &Request, peer: Option<IpAddr>) -> Response {
        let cookie = match cookie_for(request) {
            Ok(cookie) => cookie,
            Err(e) => return error_response(String::new(), &e),
        };
        let span = info_span!("harvest", fqdn = %request.machine.fqdn, cookie = %cookie);
        let _enter = span.enter();

        match self.round(request, peer) {
            Ok(Outcome::Tasks(tasks)) => {
                info!(tasks = tasks.len(), "Round needs client tasks");
                Response {
                    server_version: PROTOCOL_VERSION,
                    server_cookie: cookie,
                    tasks,
                    ..Default::default()
                }
            }
            Ok(Outcome::Products(products)) => {
                info!(products = products.len(), "Round complete");
                Response {
                    server_version: PROTOCOL_VERSION,
                    server_cookie: cookie,
                    products,
                    ..Default::default()
                }
            }
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "Round failed");
                error_response(cookie, &e)
            }
        }
    }

    pub fn round(&self, request: &Request, peer: Option<IpAddr>) -> HarvestResult<Outcome> {
        if request.client_version != PROTOCOL_VERSION {
            return Err(HarvestError::Protocol(format!(
                "unsupported client version {}",
                request.client_version
            )));
        }
        if request.task_responses.len() > self.limits.max_task_responses {
            return Err(HarvestError::Protocol(format!(
                "{} task responses exceed the limit of {}",
                request.task_responses.len(),
                self.limits.max_task_responses
            )));
        }

        let env = Environment::for_request(&request.machine, peer, self.backends.x509_names());
        let responses = TaskResponses::decode(&self.codec, &request.task_responses)?;
        let ctx = Context {
            env: &env,
            backends: &self.backends,
            responses: &responses,
        };

        let mut active: Vec<&dyn Producer> = Vec::new();
        for policy in &self.policies {
            if policy.verify(&env)? {
                active.extend(policy.producers.iter().map(|p| p.as_ref()));
            }
        }

        let mut pending = Vec::new();
        for producer in &active {
            let tasks = producer
                .prepare(&ctx)
                .map_err(|source| producer_error(*producer, source))?;
            for (key, task) in tasks {
                debug!(producer = %producer.name(), key = %key, kind = task.kind(), "Task required");
                pending.push(task.to_wire(&key)?);
            }
        }
        if !pending.is_empty() {
            return Ok(Outcome::Tasks(pending));
        }

        let mut products = Vec::new();
        for producer in &active {
            let produced = producer
                .produce(&ctx)
                .map_err(|source| producer_error(*producer, source))?;
            products.extend(produced);
        }
        Ok(Outcome::Products(products))
    }
}

fn producer_error(producer: &dyn Producer, source: crate::error::ProducerError) -> HarvestError {
    HarvestError::Producer {
        producer: producer.name().to_string(),
        source,
    }
}

/// Echo the client's cookie, or issue a new one
pub fn cookie_for(request: &Request) -> HarvestResult<String> {
    match &request.server_cookie {
        Some(cookie) => Ok(cookie.clone()),
        None => issue_cookie(),
    }
}

/// Fresh random cookie, hex encoded
pub fn issue_cookie() -> HarvestResult<String> {
    let mut bytes = [0u8; COOKIE_LEN];
    aws_lc_rs::rand::fill(&mut bytes)
        .map_err(|_| HarvestError::Internal("random source unavailable".to_string()))?;
    Ok(hex::encode(bytes))
}

/// Response carrying exactly one error and nothing else
pub fn error_response(cookie: String, error: &HarvestError) -> Response {
    Response {
        server_version: PROTOCOL_VERSION,
        server_cookie: cookie,
        errors: vec![ErrorEntry {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }],
        ..Default::default()
    }
}
