//! Compatibility gate in front of the directory compatibility checker.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors reaching the compatibility checker.
#[derive(Debug, Error)]
pub enum CheckerError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Checker answered with something we can't interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Checker is not reachable.
    #[error("checker unavailable: {0}")]
    Unavailable(String),
}

/// Raw answer of the compatibility checker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    #[serde(default)]
    pub compatibility_errors: Vec<String>,
    #[serde(default)]
    pub opensearch_version: Option<String>,
    #[serde(default)]
    pub info: serde_json::Value,
}

/// Inspects an existing installation and reports whether its data can be migrated.
#[async_trait]
pub trait CompatibilityChecker: Send + Sync {
    async fn check(&self, installation: &str) -> Result<CompatibilityReport, CheckerError>;
}

/// Gate verdict. `ok` is true iff `errors` is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityResult {
    pub ok: bool,
    pub errors: Vec<String>,
    pub detected_version: Option<String>,
    pub node_info: serde_json::Value,
}

impl CompatibilityResult {
    fn from_errors(errors: Vec<String>, detected_version: Option<String>, node_info: serde_json::Value) -> Self {
        Self {
            ok: errors.is_empty(),
            errors,
            detected_version,
            node_info,
        }
    }

    /// First error, or all of them joined when there are several.
    pub fn summary(&self) -> Option<String> {
        match self.errors.as_slice() {
            [] => None,
            [only] => Some(only.clone()),
            many => Some(many.join("; ")),
        }
    }
}

/// Wraps a [`CompatibilityChecker`] so that every failure comes back as data.
#[derive(Clone)]
pub struct CompatibilityGate {
    checker: Arc<dyn CompatibilityChecker>,
}

impl CompatibilityGate {
    pub fn new(checker: Arc<dyn CompatibilityChecker>) -> Self {
        Self { checker }
    }

    /// Ask the checker once. Never caches.
    #[tracing::instrument(skip(self))]
    pub async fn check(&self, installation: &str) -> CompatibilityResult {
        match self.checker.check(installation).await {
            Ok(report) => {
                debug!(
                    errors = report.compatibility_errors.len(),
                    version = ?report.opensearch_version,
                    "compatibility report received"
                );
                CompatibilityResult::from_errors(
                    report.compatibility_errors,
                    report.opensearch_version,
                    report.info,
                )
            }
            Err(e) => {
                warn!(error = %e, "compatibility checker failed");
                CompatibilityResult::from_errors(
                    vec![format!("compatibility check failed: {}", e)],
                    None,
                    serde_json::Value::Null,
                )
            }
        }
    }
}

/// Node ids listed in a checker's `info` object.
///
/// Accepts `{"nodes": ["a", "b"]}`, `{"nodes": [{"node_id": "a"}]}` and
/// `{"node_id": "a"}`.
pub fn discovered_nodes(info: &serde_json::Value) -> Vec<String> {
    let mut nodes: Vec<String> = match info.get("nodes").and_then(|n| n.as_array()) {
        Some(items) => items
            .iter()
            .filter_map(|item| {
                item.as_str()
                    .or_else(|| item.get("node_id").and_then(|id| id.as_str()))
                    .map(String::from)
            })
            .collect(),
        None => info
            .get("node_id")
            .and_then(|id| id.as_str())
            .map(|id| vec![id.to_string()])
            .unwrap_or_default(),
    };
    nodes.sort();
    nodes.dedup();
    nodes
}
