//! taskd agent library
//!
//! HTTP client for the `taskd` task endpoints, the executors that carry out
//! dispatched tasks, and the poller tying both together.

pub mod config;
pub mod executor;
pub mod poller;
pub mod shell;

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use taskd_common::{ConfirmAck, ConfirmRequest, DispatchedTask, Outcome, SecretRing, TaskId};
use tracing::debug;

pub use executor::{CommandExecutor, ExecutorSet, MessageExecutor, MessageSurface, TaskExecutor};
pub use poller::{CycleReport, Poller, TaskChannel};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unauthorized")]
    Unauthorized,
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Client bound to one host identity on one `taskd` server.
#[derive(Clone)]
pub struct HttpChannel {
    http: reqwest::Client,
    base_url: String,
    host: String,
    token: String,
}

impl HttpChannel {
    pub fn new(
        base_url: &str,
        host: &str,
        secrets: &SecretRing,
        request_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("taskd-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            host: host.to_string(),
            token: secrets.derive(host),
        })
    }

    pub async fn fetch_tasks(&self) -> Result<Vec<DispatchedTask>, ClientError> {
        let url = format!("{}/api/tasks", self.base_url);
        debug!(%url, host = %self.host, "fetching tasks");
        let response = self
            .http
            .get(url)
            .query(&[("host", self.host.as_str()), ("token", self.token.as_str())])
            .send()
            .await?;
        decode(response).await
    }

    pub async fn confirm_task(
        &self,
        task_id: TaskId,
        outcome: &Outcome,
    ) -> Result<ConfirmAck, ClientError> {
        let url = format!("{}/api/confirm", self.base_url);
        let report = ConfirmRequest {
            task_id,
            host: self.host.clone(),
            status: outcome.status,
            message: outcome.message.clone(),
            token: Some(self.token.clone()),
        };
        let response = self.http.post(url).json(&report).send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    match response.status() {
        StatusCode::UNAUTHORIZED => return Err(ClientError::Unauthorized),
        status if !status.is_success() => return Err(ClientError::Status(status.as_u16())),
        _ => {}
    }
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}
