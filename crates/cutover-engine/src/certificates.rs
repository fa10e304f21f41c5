//! Certificate provisioning across the data nodes of one migration.
//!
//! The coordinator owns the per-node status records. A background loop
//! provisions pending nodes and pulls status for issued ones; the backend may
//! also push status through [`CertificateCoordinator::report`]. The state
//! machine only ever sees [`AggregateStatus`] snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Errors from the certificate backend.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend refused or failed the request.
    #[error("backend error: {0}")]
    Backend(String),

    /// Node is not part of the tracked set.
    #[error("unknown node: {0}")]
    UnknownNode(String),
}

/// Provisioning phase of a single node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodePhase {
    /// Waiting for a certificate request to be accepted.
    #[default]
    Pending,
    /// Certificate issued, not yet installed on the node.
    Issued,
    /// Certificate installed; node is ready.
    Installed,
    /// Provisioning failed and automatic retries are exhausted.
    Failed,
}

/// Status record for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProvisioningStatus {
    pub node_id: String,
    pub phase: NodePhase,
    /// Failed attempts since the last (re-)provision.
    pub attempts: u32,
    pub last_updated: DateTime<Utc>,
}

impl NodeProvisioningStatus {
    fn new(node_id: String) -> Self {
        Self {
            node_id,
            phase: NodePhase::Pending,
            attempts: 0,
            last_updated: Utc::now(),
        }
    }
}

/// Read-only view handed to the state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStatus {
    pub all_installed: bool,
    pub pending: BTreeSet<String>,
    pub failed: BTreeSet<String>,
}

impl AggregateStatus {
    /// Operator-facing reason the gate is still closed.
    pub fn blocking_reason(&self) -> Option<String> {
        if self.all_installed {
            return None;
        }
        let mut parts = Vec::new();
        if !self.failed.is_empty() {
            parts.push(format!(
                "certificate provisioning failed on: {}",
                join(&self.failed)
            ));
        }
        if !self.pending.is_empty() {
            parts.push(format!(
                "waiting for certificates on: {}",
                join(&self.pending)
            ));
        }
        if parts.is_empty() {
            parts.push("no data nodes are being provisioned".to_string());
        }
        Some(parts.join("; "))
    }
}

fn join(nodes: &BTreeSet<String>) -> String {
    nodes.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// Issues certificates and reports installation progress.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Request issuance and installation of a certificate for `node_id`.
    async fn provision(&self, node_id: &str) -> Result<(), ProvisioningError>;

    /// Current phase of `node_id` as seen by the backend.
    async fn status(&self, node_id: &str) -> Result<NodePhase, ProvisioningError>;
}

#[derive(Default)]
struct Tracked {
    /// Bumped whenever the node set is replaced; stale loop writes are dropped.
    generation: u64,
    nodes: BTreeMap<String, NodeProvisioningStatus>,
}

/// Tracks certificate provisioning for one migration.
pub struct CertificateCoordinator {
    migration: String,
    backend: Arc<dyn ProvisioningBackend>,
    poll_interval: Duration,
    max_attempts: u32,
    tracked: RwLock<Tracked>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CertificateCoordinator {
    pub fn new(
        migration: impl Into<String>,
        backend: Arc<dyn ProvisioningBackend>,
        poll_interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            migration: migration.into(),
            backend,
            poll_interval,
            max_attempts: max_attempts.max(1),
            tracked: RwLock::new(Tracked::default()),
            worker: Mutex::new(None),
        }
    }

    /// Start tracking `nodes`.
    ///
    /// No-op when already running for the same set. A different set replaces
    /// the tracked nodes and restarts the refresh loop. Returns true if the
    /// loop was (re)started.
    #[tracing::instrument(skip(self, nodes), fields(migration = %self.migration, nodes = nodes.len()))]
    pub async fn start(self: &Arc<Self>, nodes: BTreeSet<String>) -> bool {
        let mut worker = self.worker.lock().await;
        let running = worker.as_ref().is_some_and(|h| !h.is_finished());

        {
            let mut tracked = self.tracked.write().await;
            let same_set = tracked.nodes.keys().eq(nodes.iter());
            if same_set && running {
                debug!("provisioning already running for this node set");
                return false;
            }
            if !same_set {
                tracked.generation += 1;
                tracked.nodes = nodes
                    .into_iter()
                    .map(|id| (id.clone(), NodeProvisioningStatus::new(id)))
                    .collect();
            }
        }

        if let Some(handle) = worker.take() {
            handle.abort();
        }
        *worker = Some(self.spawn_loop());
        info!("certificate provisioning started");
        true
    }

    fn spawn_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.poll_interval;
        tokio::spawn(async move {
            // First pass runs one period after start.
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.refresh().await;
            }
        })
    }

    /// Stop the refresh loop. Status records are kept.
    pub async fn stop(&self) {
        if let Some(handle) = self.worker.lock().await.take() {
            handle.abort();
            debug!(migration = %self.migration, "certificate refresh loop stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Snapshot of the aggregate status. Never touches the backend.
    pub async fn poll(&self) -> AggregateStatus {
        let tracked = self.tracked.read().await;
        let mut status = AggregateStatus::default();
        for node in tracked.nodes.values() {
            match node.phase {
                NodePhase::Installed => {}
                NodePhase::Failed => {
                    status.failed.insert(node.node_id.clone());
                }
                NodePhase::Pending | NodePhase::Issued => {
                    status.pending.insert(node.node_id.clone());
                }
            }
        }
        status.all_installed =
            !tracked.nodes.is_empty() && status.pending.is_empty() && status.failed.is_empty();
        status
    }

    /// Per-node records, ordered by node id.
    pub async fn statuses(&self) -> Vec<NodeProvisioningStatus> {
        self.tracked.read().await.nodes.values().cloned().collect()
    }

    /// One refresh pass: provision pending nodes, pull status of issued ones.
    pub async fn refresh(&self) {
        let (generation, work): (u64, Vec<(String, NodePhase)>) = {
            let tracked = self.tracked.read().await;
            let work = tracked
                .nodes
                .values()
                .filter(|n| matches!(n.phase, NodePhase::Pending | NodePhase::Issued))
                .map(|n| (n.node_id.clone(), n.phase))
                .collect();
            (tracked.generation, work)
        };

        for (node_id, phase) in work {
            match phase {
                NodePhase::Pending => match self.backend.provision(&node_id).await {
                    Ok(()) => {
                        self.apply(generation, &node_id, NodePhase::Issued).await;
                    }
                    Err(e) => {
                        warn!(migration = %self.migration, node = %node_id, error = %e, "certificate request failed");
                        self.apply(generation, &node_id, NodePhase::Failed).await;
                    }
                },
                NodePhase::Issued => match self.backend.status(&node_id).await {
                    Ok(phase @ (NodePhase::Installed | NodePhase::Failed)) => {
                        self.apply(generation, &node_id, phase).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Status reads are retried on the next tick without counting an attempt.
                        debug!(migration = %self.migration, node = %node_id, error = %e, "status read failed");
                    }
                },
                NodePhase::Installed | NodePhase::Failed => {}
            }
        }
    }

    /// Push path for the provisioning backend.
    pub async fn report(&self, node_id: &str, phase: NodePhase) -> Result<(), ProvisioningError> {
        let generation = {
            let tracked = self.tracked.read().await;
            if !tracked.nodes.contains_key(node_id) {
                return Err(ProvisioningError::UnknownNode(node_id.to_string()));
            }
            tracked.generation
        };
        self.apply(generation, node_id, phase).await;
        Ok(())
    }

    /// Reset every exhausted node to pending with a fresh attempt budget.
    ///
    /// Returns the node ids that were reset.
    pub async fn reprovision(&self) -> Vec<String> {
        let mut tracked = self.tracked.write().await;
        let mut reset = Vec::new();
        for node in tracked.nodes.values_mut() {
            if node.phase == NodePhase::Failed {
                node.phase = NodePhase::Pending;
                node.attempts = 0;
                node.last_updated = Utc::now();
                reset.push(node.node_id.clone());
            }
        }
        if !reset.is_empty() {
            info!(migration = %self.migration, nodes = ?reset, "re-provisioning failed nodes");
        }
        reset
    }

    async fn apply(&self, generation: u64, node_id: &str, reported: NodePhase) {
        let mut tracked = self.tracked.write().await;
        if tracked.generation != generation {
            return;
        }
        let max_attempts = self.max_attempts;
        let Some(node) = tracked.nodes.get_mut(node_id) else {
            return;
        };
        // Exhausted nodes only come back through reprovision().
        if node.phase == NodePhase::Failed {
            return;
        }

        match reported {
            NodePhase::Failed => {
                node.attempts += 1;
                if node.attempts >= max_attempts {
                    node.phase = NodePhase::Failed;
                    warn!(
                        migration = %self.migration,
                        node = %node_id,
                        attempts = node.attempts,
                        "certificate provisioning exhausted retries"
                    );
                } else {
                    node.phase = NodePhase::Pending;
                    debug!(migration = %self.migration, node = %node_id, attempts = node.attempts, "retrying certificate provisioning");
                }
            }
            NodePhase::Installed => {
                node.phase = NodePhase::Installed;
                info!(migration = %self.migration, node = %node_id, "certificate installed");
            }
            NodePhase::Issued => {
                if node.phase == NodePhase::Pending {
                    node.phase = NodePhase::Issued;
                }
            }
            NodePhase::Pending => {
                if node.phase != NodePhase::Installed {
                    node.phase = NodePhase::Pending;
                }
            }
        }
        node.last_updated = Utc::now();
    }
}

impl Drop for CertificateCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            handle.abort();
        }
    }
}

/// In-process backend for tests and local runs.
///
/// Phases are set by hand, or advance straight to installed when built with
/// [`InMemoryProvisioningBackend::auto_installing`].
#[derive(Default)]
pub struct InMemoryProvisioningBackend {
    phases: DashMap<String, NodePhase>,
    provision_calls: DashMap<String, u32>,
    always_failing: DashSet<String>,
    auto_install: bool,
}

impl InMemoryProvisioningBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that installs certificates as soon as they are requested.
    pub fn auto_installing() -> Self {
        Self {
            auto_install: true,
            ..Self::default()
        }
    }

    pub fn set_phase(&self, node_id: &str, phase: NodePhase) {
        self.phases.insert(node_id.to_string(), phase);
    }

    /// Make every status read of `node_id` report failure.
    pub fn fail_always(&self, node_id: &str) {
        self.always_failing.insert(node_id.to_string());
    }

    pub fn heal(&self, node_id: &str) {
        self.always_failing.remove(node_id);
    }

    pub fn provision_calls(&self, node_id: &str) -> u32 {
        self.provision_calls.get(node_id).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl ProvisioningBackend for InMemoryProvisioningBackend {
    async fn provision(&self, node_id: &str) -> Result<(), ProvisioningError> {
        *self.provision_calls.entry(node_id.to_string()).or_insert(0) += 1;
        let phase = if self.auto_install {
            NodePhase::Installed
        } else {
            NodePhase::Issued
        };
        self.phases.insert(node_id.to_string(), phase);
        Ok(())
    }

    async fn status(&self, node_id: &str) -> Result<NodePhase, ProvisioningError> {
        if self.always_failing.contains(node_id) {
            return Ok(NodePhase::Failed);
        }
        Ok(self.phases.get(node_id).map(|p| *p).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn nodes(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn coordinator(backend: Arc<InMemoryProvisioningBackend>, max_attempts: u32) -> Arc<CertificateCoordinator> {
        // Long interval: the loop never fires, tests drive refresh() by hand.
        Arc::new(CertificateCoordinator::new(
            "m1",
            backend,
            Duration::from_secs(3600),
            max_attempts,
        ))
    }

    #[tokio::test]
    async fn test_poll_before_start_is_not_installed() {
        let coord = coordinator(Arc::new(InMemoryProvisioningBackend::new()), 3);
        let status = coord.poll().await;
        assert!(!status.all_installed);
        assert!(status.pending.is_empty());
        assert_eq!(
            status.blocking_reason().as_deref(),
            Some("no data nodes are being provisioned")
        );
    }

    #[tokio::test]
    async fn test_converges_when_all_installed() {
        let backend = Arc::new(InMemoryProvisioningBackend::new());
        let coord = coordinator(backend.clone(), 3);
        coord.start(nodes(&["n1", "n2"])).await;
        coord.refresh().await;

        let status = coord.poll().await;
        assert!(!status.all_installed);
        assert_eq!(status.pending, nodes(&["n1", "n2"]));

        backend.set_phase("n1", NodePhase::Installed);
        coord.refresh().await;
        assert_eq!(coord.poll().await.pending, nodes(&["n2"]));

        backend.set_phase("n2", NodePhase::Installed);
        coord.refresh().await;
        let status = coord.poll().await;
        assert!(status.all_installed);
        assert!(status.blocking_reason().is_none());
    }

    #[tokio::test]
    async fn test_start_same_set_is_noop() {
        let backend = Arc::new(InMemoryProvisioningBackend::new());
        let coord = coordinator(backend.clone(), 3);
        assert!(coord.start(nodes(&["n1"])).await);
        coord.refresh().await;
        assert!(!coord.start(nodes(&["n1"])).await);
        coord.refresh().await;

        // Issued nodes are polled, never re-requested.
        assert_eq!(backend.provision_calls("n1"), 1);
        assert!(coord.is_running().await);
    }

    #[tokio::test]
    async fn test_start_different_set_replaces() {
        let backend = Arc::new(InMemoryProvisioningBackend::new());
        let coord = coordinator(backend, 3);
        coord.start(nodes(&["n1"])).await;
        assert!(coord.start(nodes(&["n2", "n3"])).await);

        let ids: Vec<String> = coord.statuses().await.into_iter().map(|s| s.node_id).collect();
        assert_eq!(ids, vec!["n2".to_string(), "n3".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_retried_then_exhausted() {
        let backend = Arc::new(InMemoryProvisioningBackend::new());
        backend.fail_always("n1");
        let coord = coordinator(backend.clone(), 2);
        coord.start(nodes(&["n1"])).await;

        // provision -> status Failed (attempt 1) -> provision -> status Failed (attempt 2)
        for _ in 0..4 {
            coord.refresh().await;
        }

        let status = coord.poll().await;
        assert!(!status.all_installed);
        assert_eq!(status.failed, nodes(&["n1"]));

        // Stays failed regardless of further refreshes.
        backend.heal("n1");
        coord.refresh().await;
        assert_eq!(coord.poll().await.failed, nodes(&["n1"]));

        assert_eq!(coord.reprovision().await, vec!["n1".to_string()]);
        coord.refresh().await; // provision
        backend.set_phase("n1", NodePhase::Installed);
        coord.refresh().await; // status
        assert!(coord.poll().await.all_installed);
    }

    #[tokio::test]
    async fn test_single_failure_recovers() {
        let backend = Arc::new(InMemoryProvisioningBackend::new());
        let coord = coordinator(backend.clone(), 3);
        coord.start(nodes(&["n1"])).await;
        coord.refresh().await;

        coord.report("n1", NodePhase::Failed).await.unwrap();
        let record = coord.statuses().await.remove(0);
        assert_eq!(record.phase, NodePhase::Pending);
        assert_eq!(record.attempts, 1);

        coord.refresh().await;
        coord.report("n1", NodePhase::Installed).await.unwrap();
        assert!(coord.poll().await.all_installed);
        assert_eq!(backend.provision_calls("n1"), 2);
    }

    #[tokio::test]
    async fn test_report_unknown_node() {
        let coord = coordinator(Arc::new(InMemoryProvisioningBackend::new()), 3);
        coord.start(nodes(&["n1"])).await;
        let err = coord.report("ghost", NodePhase::Installed).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::UnknownNode(ref n) if n == "ghost"));
    }

    #[tokio::test]
    async fn test_stop_halts_loop() {
        let coord = coordinator(Arc::new(InMemoryProvisioningBackend::new()), 3);
        coord.start(nodes(&["n1"])).await;
        coord.stop().await;
        assert!(!coord.is_running().await);
        // Restarting the same set after a stop spins the loop back up.
        assert!(coord.start(nodes(&["n1"])).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_refreshes() {
        let backend = Arc::new(InMemoryProvisioningBackend::auto_installing());
        let coord = Arc::new(CertificateCoordinator::new(
            "m1",
            backend,
            Duration::from_secs(5),
            3,
        ));
        coord.start(nodes(&["n1"])).await;

        // Auto-installing backend converges after the loop's first tick.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(6)).await;
        }
        assert!(coord.poll().await.all_installed);
    }
}
