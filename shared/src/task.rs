//! Typed tasks and task responses
//!
//! A task travels as an untyped [`WireTask`] envelope whose `type` string
//! selects the concrete body. [`TaskCodec`] holds the table of known types;
//! anything outside it fails closed.

use crate::{Product, WireTask, WireTaskResponse};
use rcgen::{KeyPair, SignatureAlgorithm};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Discriminator for client-side ECDSA key generation
pub const ECDSA_KEY_TYPE: &str = "ecdsa-key";

/// Upper bound on correlation key segments
pub const MAX_KEY_SEGMENTS: usize = 4;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("malformed {kind} body: {source}")]
    MalformedBody {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid correlation key {0:?}: expected 1 to {max} non-empty segments", max = MAX_KEY_SEGMENTS)]
    InvalidKey(Vec<String>),

    #[error("invalid {curve} public key: {reason}")]
    InvalidPublicKey { curve: Curve, reason: String },
}

#[derive(Debug, Error)]
pub enum SolveError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("key generation failed: {0}")]
    KeyGeneration(#[from] rcgen::Error),
}

/// Correlation key tying a task to its response and to its producer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey(Vec<String>);

impl TaskKey {
    pub fn new(segments: Vec<String>) -> Result<Self, CodecError> {
        if segments.is_empty()
            || segments.len() > MAX_KEY_SEGMENTS
            || segments.iter().any(|s| s.is_empty())
        {
            return Err(CodecError::InvalidKey(segments));
        }
        Ok(Self(segments))
    }

    /// Key made of a single segment, typically a producer name
    pub fn single(name: impl Into<String>) -> Result<Self, CodecError> {
        Self::new(vec![name.into()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// Named curves a client can be asked to generate a key on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Curve {
    #[serde(rename = "P-256")]
    P256,
    #[serde(rename = "P-384")]
    P384,
    #[serde(rename = "P-521")]
    P521,
}

impl Curve {
    /// Width in bytes of one affine coordinate
    pub fn coordinate_len(self) -> usize {
        match self {
            Curve::P256 => 32,
            Curve::P384 => 48,
            Curve::P521 => 66,
        }
    }

    pub fn signature_algorithm(self) -> &'static SignatureAlgorithm {
        match self {
            Curve::P256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Curve::P384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            Curve::P521 => &rcgen::PKCS_ECDSA_P521_SHA512,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Curve::P256 => "P-256",
            Curve::P384 => "P-384",
            Curve::P521 => "P-521",
        }
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate an ECDSA key pair, keep the private half, report the public one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdsaKeyTask {
    pub curve: Curve,
    /// Destination of the private key; the body is filled in by the client
    pub template: Product,
}

/// Public half of a client-generated ECDSA key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdsaKeyResponse {
    pub curve: Curve,
    #[serde(with = "hex")]
    pub x: Vec<u8>,
    #[serde(with = "hex")]
    pub y: Vec<u8>,
}

impl EcdsaKeyResponse {
    /// Split an uncompressed SEC1 point into its coordinates
    pub fn from_point(curve: Curve, point: &[u8]) -> Result<Self, CodecError> {
        let n = curve.coordinate_len();
        if point.len() != 1 + 2 * n || point[0] != 0x04 {
            return Err(CodecError::InvalidPublicKey {
                curve,
                reason: format!("expected {} byte uncompressed point", 1 + 2 * n),
            });
        }
        Ok(Self {
            curve,
            x: point[1..=n].to_vec(),
            y: point[1 + n..].to_vec(),
        })
    }

    /// Uncompressed SEC1 encoding, `04 || x || y`
    pub fn public_point(&self) -> Result<Vec<u8>, CodecError> {
        self.validate()?;
        let mut point = Vec::with_capacity(1 + self.x.len() + self.y.len());
        point.push(0x04);
        point.extend_from_slice(&self.x);
        point.extend_from_slice(&self.y);
        Ok(point)
    }

    fn validate(&self) -> Result<(), CodecError> {
        let n = self.curve.coordinate_len();
        if self.x.len() != n || self.y.len() != n {
            return Err(CodecError::InvalidPublicKey {
                curve: self.curve,
                reason: format!("coordinates must be {} bytes each", n),
            });
        }
        Ok(())
    }
}

/// Concrete task, decoded from a [`WireTask`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    EcdsaKey(EcdsaKeyTask),
}

/// Concrete task response, decoded from a [`WireTaskResponse`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResponse {
    EcdsaKey(EcdsaKeyResponse),
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Task::EcdsaKey(_) => ECDSA_KEY_TYPE,
        }
    }

    pub fn to_wire(&self, key: &TaskKey) -> Result<WireTask, CodecError> {
        let body = match self {
            Task::EcdsaKey(t) => serde_json::to_value(t),
        }
        .map_err(|source| CodecError::MalformedBody {
            kind: self.kind().to_string(),
            source,
        })?;

        Ok(WireTask {
            name: key.segments().to_vec(),
            kind: self.kind().to_string(),
            body,
        })
    }

    /// Carry out the task locally.
    ///
    /// Returns the products that stay on the machine (private material)
    /// together with the response to send back.
    pub fn solve(&self) -> Result<(Vec<Product>, TaskResponse), SolveError> {
        match self {
            Task::EcdsaKey(t) => {
                let key_pair = KeyPair::generate_for(t.curve.signature_algorithm())?;
                let response = EcdsaKeyResponse::from_point(t.curve, key_pair.public_key_raw())?;

                let mut product = t.template.clone();
                product.body = key_pair.serialize_pem().into_bytes();

                Ok((vec![product], TaskResponse::EcdsaKey(response)))
            }
        }
    }
}

impl TaskResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskResponse::EcdsaKey(_) => ECDSA_KEY_TYPE,
        }
    }

    pub fn to_wire(&self, key: &TaskKey) -> Result<WireTaskResponse, CodecError> {
        let body = match self {
            TaskResponse::EcdsaKey(r) => serde_json::to_value(r),
        }
        .map_err(|source| CodecError::MalformedBody {
            kind: self.kind().to_string(),
            source,
        })?;

        Ok(WireTaskResponse {
            name: key.segments().to_vec(),
            kind: self.kind().to_string(),
            body,
        })
    }
}

type TaskDecoder = fn(serde_json::Value) -> Result<Task, CodecError>;
type ResponseDecoder = fn(serde_json::Value) -> Result<TaskResponse, CodecError>;

struct Decoders {
    task: TaskDecoder,
    response: ResponseDecoder,
}

/// Table of task types this build understands
pub struct TaskCodec {
    decoders: HashMap<&'static str, Decoders>,
}

impl TaskCodec {
    /// Codec with no registered types; every decode fails
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Codec with every task type shipped in this crate
    pub fn standard() -> Self {
        let mut codec = Self::empty();
        codec.register(ECDSA_KEY_TYPE, decode_ecdsa_task, decode_ecdsa_response);
        codec
    }

    pub fn register(
        &mut self,
        kind: &'static str,
        task: TaskDecoder,
        response: ResponseDecoder,
    ) {
        self.decoders.insert(kind, Decoders { task, response });
    }

    pub fn decode_task(&self, wire: &WireTask) -> Result<(TaskKey, Task), CodecError> {
        let decoders = self
            .decoders
            .get(wire.kind.as_str())
            .ok_or_else(|| CodecError::UnknownTaskType(wire.kind.clone()))?;
        let key = TaskKey::new(wire.name.clone())?;
        Ok((key, (decoders.task)(wire.body.clone())?))
    }

    pub fn decode_response(
        &self,
        wire: &WireTaskResponse,
    ) -> Result<(TaskKey, TaskResponse), CodecError> {
        let decoders = self
            .decoders
            .get(wire.kind.as_str())
            .ok_or_else(|| CodecError::UnknownTaskType(wire.kind.clone()))?;
        let key = TaskKey::new(wire.name.clone())?;
        Ok((key, (decoders.response)(wire.body.clone())?))
    }

    /// Decode a task, solve it, and encode the response under the same key
    pub fn solve(&self, wire: &WireTask) -> Result<(Vec<Product>, WireTaskResponse), SolveError> {
        let (key, task) = self.decode_task(wire)?;
        let (products, response) = task.solve()?;
        Ok((products, response.to_wire(&key)?))
    }
}

impl Default for TaskCodec {
    fn default() -> Self {
        Self::standard()
    }
}

fn decode_ecdsa_task(body: serde_json::Value) -> Result<Task, CodecError> {
    serde_json::from_value(body)
        .map(Task::EcdsaKey)
        .map_err(|source| CodecError::MalformedBody {
            kind: ECDSA_KEY_TYPE.to_string(),
            source,
        })
}

fn decode_ecdsa_response(body: serde_json::Value) -> Result<TaskResponse, CodecError> {
    let response: EcdsaKeyResponse =
        serde_json::from_value(body).map_err(|source| CodecError::MalformedBody {
            kind: ECDSA_KEY_TYPE.to_string(),
            source,
        })?;
    response.validate()?;
    Ok(TaskResponse::EcdsaKey(response))
}
