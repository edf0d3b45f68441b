//! Error types for the redoubt server

use crate::expr::ValueKind;
use shared::task::{CodecError, Curve, TaskKey};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Startup-time failures; these never reach the wire
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unknown producer type '{kind}' for producer '{name}'")]
    UnknownProducerType { kind: String, name: String },

    #[error("unknown backend type '{kind}' for backend '{name}'")]
    UnknownBackendType { kind: String, name: String },

    #[error("unknown probe type '{kind}' in policy '{policy}'")]
    UnknownProbeType { kind: String, policy: String },

    #[error("duplicate producer name '{0}'")]
    DuplicateProducer(String),

    #[error("duplicate backend name '{0}'")]
    DuplicateBackend(String),

    #[error("duplicate policy name '{0}'")]
    DuplicatePolicy(String),

    #[error("invalid configuration for {what}: {source}")]
    Invalid {
        what: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration for {what}: {reason}")]
    Rejected { what: String, reason: String },

    #[error("backend '{name}': {source}")]
    Backend {
        name: String,
        #[source]
        source: BackendError,
    },
}

impl ConfigError {
    pub fn rejected(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            what: what.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("unknown reference ${{{0}}}")]
    UnknownReference(String),

    #[error("type mismatch: expected {expected}, got {found}")]
    TypeMismatch { expected: ValueKind, found: ValueKind },
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("can't decode PEM in {path}: {reason}")]
    Pem { path: PathBuf, reason: String },

    #[error("bad PEM type '{tag}' in {path}")]
    PemType { path: PathBuf, tag: String },

    #[error("invalid certificate in {path}: {reason}")]
    Certificate { path: PathBuf, reason: String },

    #[error("invalid private key in {path}: {source}")]
    Key {
        path: PathBuf,
        #[source]
        source: rcgen::Error,
    },

    #[error("private key {key} does not match certificate {cert}")]
    KeyMismatch { key: PathBuf, cert: PathBuf },

    #[error("invalid DNS name '{0}'")]
    InvalidDnsName(String),

    #[error(transparent)]
    Signing(#[from] rcgen::Error),
}

#[derive(Error, Debug)]
pub enum ProbeError {
    /// The request does not satisfy the probe; the policy is skipped
    #[error("rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Eval(#[from] EvalError),
}

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("no such backend: {0}")]
    UnknownBackend(String),

    #[error("missing task response {0}")]
    MissingResponse(TaskKey),

    #[error("task response {key} has type {found}, expected {expected}")]
    ResponseType {
        key: TaskKey,
        expected: &'static str,
        found: &'static str,
    },

    #[error("task response {key} is for curve {found}, expected {expected}")]
    CurveMismatch {
        key: TaskKey,
        expected: Curve,
        found: Curve,
    },

    #[error("invalid IP address '{0}'")]
    InvalidIp(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to generate serial number")]
    Serial,

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Request-time failures, reported to the client as one `Error` entry
#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("bad request: {0}")]
    Protocol(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("policy '{policy}': {source}")]
    Probe {
        policy: String,
        #[source]
        source: ProbeError,
    },

    #[error("producer '{producer}': {source}")]
    Producer {
        producer: String,
        #[source]
        source: ProducerError,
    },

    #[error("round did not finish within {0:?}")]
    Timeout(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HarvestError {
    /// Value of the wire `Error.type` field
    pub fn kind(&self) -> &'static str {
        match self {
            HarvestError::Protocol(_) => "protocol",
            HarvestError::Codec(_) => "codec",
            HarvestError::Probe { .. } => "probe",
            HarvestError::Producer { source, .. } => match source {
                ProducerError::Eval(_) => "expression",
                ProducerError::Backend(_) | ProducerError::UnknownBackend(_) => "backend",
                ProducerError::Codec(_) => "codec",
                _ => "producer",
            },
            HarvestError::Timeout(_) => "timeout",
            HarvestError::Internal(_) => "internal",
        }
    }
}

pub type HarvestResult<T> = Result<T, HarvestError>;
