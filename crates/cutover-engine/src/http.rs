//! HTTP clients for the external collaborators: compatibility checker,
//! certificate provisioning backend and message-processing control.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::certificates::{NodePhase, ProvisioningBackend, ProvisioningError};
use crate::downtime::{MessageProcessing, ProcessingError};
use crate::gate::{CheckerError, CompatibilityChecker, CompatibilityReport};

/// Connect timeout shared by every collaborator client.
const CONNECT_TIMEOUT_SECS: u64 = 10;

fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS).min(timeout))
        .timeout(timeout)
        .build()
}

fn trim_base(base_url: impl Into<String>) -> String {
    base_url.into().trim_end_matches('/').to_string()
}

/// Queries `GET {base}/compatibility/{installation}`.
#[derive(Debug, Clone)]
pub struct HttpCompatibilityChecker {
    http: Client,
    base_url: String,
}

impl HttpCompatibilityChecker {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CheckerError> {
        Ok(Self {
            http: build_client(timeout)?,
            base_url: trim_base(base_url),
        })
    }
}

#[async_trait]
impl CompatibilityChecker for HttpCompatibilityChecker {
    async fn check(&self, installation: &str) -> Result<CompatibilityReport, CheckerError> {
        let url = format!("{}/compatibility/{}", self.base_url, installation);
        debug!(url = %url, "querying compatibility checker");

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CheckerError::Unavailable(format!("{}: {}", status, body)));
        }

        response
            .json::<CompatibilityReport>()
            .await
            .map_err(|e| CheckerError::InvalidResponse(e.to_string()))
    }
}

/// Talks to the certificate provisioning backend.
///
/// - `POST {base}/certificates/provision/{node}` requests a certificate
/// - `GET {base}/certificates/status/{node}` returns `{ "phase": "..." }`
#[derive(Debug, Clone)]
pub struct HttpProvisioningBackend {
    http: Client,
    base_url: String,
}

impl HttpProvisioningBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProvisioningError> {
        Ok(Self {
            http: build_client(timeout)?,
            base_url: trim_base(base_url),
        })
    }
}

#[derive(Deserialize)]
struct PhaseBody {
    phase: NodePhase,
}

#[async_trait]
impl ProvisioningBackend for HttpProvisioningBackend {
    async fn provision(&self, node_id: &str) -> Result<(), ProvisioningError> {
        let url = format!("{}/certificates/provision/{}", self.base_url, node_id);
        let response = self.http.post(&url).send().await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ProvisioningError::UnknownNode(node_id.to_string())),
            status => Err(ProvisioningError::Backend(format!(
                "provision {} returned {}",
                node_id, status
            ))),
        }
    }

    async fn status(&self, node_id: &str) -> Result<NodePhase, ProvisioningError> {
        let url = format!("{}/certificates/status/{}", self.base_url, node_id);
        let response = self.http.get(&url).send().await?;
        match response.status() {
            status if status.is_success() => {
                let body: PhaseBody = response
                    .json()
                    .await
                    .map_err(|e| ProvisioningError::Backend(format!("invalid status body: {}", e)))?;
                Ok(body.phase)
            }
            StatusCode::NOT_FOUND => Err(ProvisioningError::UnknownNode(node_id.to_string())),
            status => Err(ProvisioningError::Backend(format!(
                "status {} returned {}",
                node_id, status
            ))),
        }
    }
}

/// Pauses and resumes processing via
/// `PUT {base}/system/processing/pause` and `PUT {base}/system/processing/resume`.
#[derive(Debug, Clone)]
pub struct HttpMessageProcessing {
    http: Client,
    base_url: String,
}

impl HttpMessageProcessing {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProcessingError> {
        Ok(Self {
            http: build_client(timeout)?,
            base_url: trim_base(base_url),
        })
    }

    async fn put(&self, verb: &str) -> Result<(), ProcessingError> {
        let url = format!("{}/system/processing/{}", self.base_url, verb);
        let response = self.http.put(&url).send().await?;
        let status = response.status();
        if status.is_success() {
            debug!(verb, "message processing control accepted");
            Ok(())
        } else {
            Err(ProcessingError::Rejected(format!("{} returned {}", verb, status)))
        }
    }
}

#[async_trait]
impl MessageProcessing for HttpMessageProcessing {
    async fn pause(&self) -> Result<(), ProcessingError> {
        self.put("pause").await
    }

    async fn resume(&self) -> Result<(), ProcessingError> {
        self.put("resume").await
    }
}
