//! Carrying one harvest round to the server

use crate::error::ClientError;
use shared::{Request, Response, HARVEST_PATH};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub trait Transport {
    fn harvest(&self, request: &Request) -> impl Future<Output = Result<Response, ClientError>> + Send;
}

/// JSON over HTTP POST
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    /// `server` is `host:port` or a base URL; a bare address means plain HTTP
    pub fn new(server: &str) -> Result<Self, ClientError> {
        let url = harvest_url(server)?;
        let client = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self { client, url })
    }
}

impl Transport for HttpTransport {
    async fn harvest(&self, request: &Request) -> Result<Response, ClientError> {
        debug!(url = %self.url, task_responses = request.task_responses.len(), "Sending harvest");

        let response = self.client.post(&self.url).json(request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }
        Ok(response.json::<Response>().await?)
    }
}

fn harvest_url(server: &str) -> Result<String, ClientError> {
    let server = server.trim().trim_end_matches('/');
    if server.is_empty() {
        return Err(ClientError::InvalidServer(server.to_string()));
    }
    let base = if server.starts_with("http://") || server.starts_with("https://") {
        server.to_string()
    } else if server.contains("://") {
        return Err(ClientError::InvalidServer(server.to_string()));
    } else {
        format!("http://{}", server)
    };
    Ok(format!("{}{}", base, HARVEST_PATH))
}
