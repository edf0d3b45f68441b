//! Producers turn a matched policy into products
//!
//! Every producer runs in two phases per round. `prepare` lists the tasks
//! the client still has to solve; `produce` is only called once no producer
//! has anything outstanding, and assembles the final products. Both are pure
//! functions of the producer configuration and the round [`Context`].

pub mod file;
pub mod pki;

use crate::backend::Backends;
use crate::error::{ConfigError, HarvestError, ProducerError};
use crate::expr::Environment;
use shared::task::{Task, TaskCodec, TaskKey, TaskResponse};
use shared::{Product, WireTaskResponse};
use std::collections::HashMap;

/// Default permission bits for products: owner read only
pub const DEFAULT_MASK: u32 = 0o400;

/// Task responses supplied by the client for this round, by correlation key
#[derive(Debug, Default)]
pub struct TaskResponses {
    by_key: HashMap<TaskKey, TaskResponse>,
}

impl TaskResponses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the wire responses; a key may appear only once
    pub fn decode(codec: &TaskCodec, wire: &[WireTaskResponse]) -> Result<Self, HarvestError> {
        let mut responses = Self::new();
        for w in wire {
            let (key, response) = codec.decode_response(w)?;
            if responses.by_key.contains_key(&key) {
                return Err(HarvestError::Protocol(format!(
                    "duplicate task response {}",
                    key
                )));
            }
            responses.by_key.insert(key, response);
        }
        Ok(responses)
    }

    pub fn insert(&mut self, key: TaskKey, response: TaskResponse) {
        self.by_key.insert(key, response);
    }

    pub fn get(&self, key: &TaskKey) -> Option<&TaskResponse> {
        self.by_key.get(key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Read-only inputs shared by every producer during one round
pub struct Context<'a> {
    pub env: &'a Environment,
    pub backends: &'a Backends,
    pub responses: &'a TaskResponses,
}

pub trait Producer: Send + Sync {
    /// Unique across the configuration; prefix of the producer's task keys
    fn name(&self) -> &str;

    fn kind(&self) -> &'static str;

    /// Tasks still required from the client, empty once satisfied
    fn prepare(&self, ctx: &Context<'_>) -> Result<Vec<(TaskKey, Task)>, ProducerError>;

    fn produce(&self, ctx: &Context<'_>) -> Result<Vec<Product>, ProducerError>;
}

/// Reject product names that would escape the client's product root
pub fn validate_product_name(what: &str, name: &[String]) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::rejected(what, "product name is empty"));
    }
    for segment in name {
        if segment.is_empty() || segment == "." || segment == ".." || segment.contains('/') {
            return Err(ConfigError::rejected(
                what,
                format!("invalid product name segment '{}'", segment),
            ));
        }
    }
    Ok(())
}

pub fn validate_mask(what: &str, mask: u32) -> Result<(), ConfigError> {
    if mask > 0o7777 {
        return Err(ConfigError::rejected(
            what,
            format!("permission mask {:o} out of range", mask),
        ));
    }
    Ok(())
}

pub(crate) fn default_mask() -> u32 {
    DEFAULT_MASK
}
