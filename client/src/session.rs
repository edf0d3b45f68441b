//! The client side of a harvest negotiation

use crate::error::ClientError;
use crate::transport::Transport;
use shared::task::TaskCodec;
use shared::{MachineInfo, Product, Request, WireTaskResponse, PROTOCOL_VERSION};
use std::collections::HashSet;
use tracing::{debug, info};

pub const DEFAULT_MAX_ROUNDS: usize = 8;

pub struct Session<T> {
    transport: T,
    machine: MachineInfo,
    codec: TaskCodec,
    max_rounds: usize,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, machine: MachineInfo) -> Self {
        Self {
            transport,
            machine,
            codec: TaskCodec::standard(),
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Negotiate until the server delivers products.
    ///
    /// The result holds the private material generated while solving tasks
    /// followed by the server's products. Nothing is returned unless the
    /// final round succeeds.
    pub async fn harvest(&self) -> Result<Vec<Product>, ClientError> {
        let mut cookie: Option<String> = None;
        let mut task_responses: Vec<WireTaskResponse> = Vec::new();
        let mut answered: HashSet<Vec<String>> = HashSet::new();
        let mut local: Vec<Product> = Vec::new();

        for round in 1..=self.max_rounds {
            let request = Request {
                client_version: PROTOCOL_VERSION,
                server_cookie: cookie.clone(),
                machine: self.machine.clone(),
                task_responses: task_responses.clone(),
            };
            let response = self.transport.harvest(&request).await?;

            if response.has_errors() {
                return Err(ClientError::Server(response.errors));
            }
            if !response.tasks.is_empty() && !response.products.is_empty() {
                return Err(ClientError::Protocol(
                    "response carries both tasks and products".to_string(),
                ));
            }
            cookie = Some(response.server_cookie);

            if response.tasks.is_empty() {
                info!(round, products = response.products.len(), "Harvest complete");
                local.extend(response.products);
                return Ok(local);
            }

            let mut progressed = false;
            for task in &response.tasks {
                if !answered.insert(task.name.clone()) {
                    debug!(key = ?task.name, "Task already answered");
                    continue;
                }
                let (products, reply) = self.codec.solve(task)?;
                debug!(key = ?task.name, kind = %task.kind, "Task solved");
                local.extend(products);
                task_responses.push(reply);
                progressed = true;
            }
            if !progressed {
                return Err(ClientError::NoProgress(round));
            }
            info!(round, tasks = response.tasks.len(), "Answered server tasks");
        }

        Err(ClientError::TooManyRounds(self.max_rounds))
    }
}
