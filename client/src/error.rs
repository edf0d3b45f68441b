//! Error types for the harvest client

use shared::task::SolveError;
use shared::ErrorEntry;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid server address '{0}'")]
    InvalidServer(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("server reported: {}", format_errors(.0))]
    Server(Vec<ErrorEntry>),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("failed to solve task: {0}")]
    Solve(#[from] SolveError),

    #[error("round {0} brought no new tasks and no products")]
    NoProgress(usize),

    #[error("gave up after {0} rounds")]
    TooManyRounds(usize),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

fn format_errors(errors: &[ErrorEntry]) -> String {
    errors
        .iter()
        .map(|e| format!("[{}] {}", e.kind, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("refusing product name {0:?}")]
    InvalidName(Vec<String>),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
