//! The migration state machine.
//!
//! [`MigrationService`] is the only writer of [`MigrationState`]. Every trigger
//! is checked against the step catalog's allow-list before any step-specific
//! gate runs, and every outcome that changes what an operator would see is
//! persisted before it is returned.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::catalog::{Step, next_steps};
use crate::certificates::{
    AggregateStatus, CertificateCoordinator, NodePhase, NodeProvisioningStatus,
    ProvisioningBackend, ProvisioningError,
};
use crate::config::MigrationConfig;
use crate::downtime::{MessageProcessing, PauseToken, estimate_window};
use crate::error::TransitionError;
use crate::gate::{CompatibilityChecker, CompatibilityGate, discovered_nodes};
use crate::state::{
    Action, MigrationState, TransitionRecord, Trigger, keys, validate_migration_id,
};
use crate::store::MigrationStore;

/// Where a trigger leads once it passed the allow-list.
enum Resolved {
    Advance { to: Step, skip: bool },
    Retry,
    EndPause,
    Replay,
}

/// Result of running a step's gate.
enum Outcome {
    /// Gate passed; move to the step.
    Advanced(Step),
    /// Gate passed; stay in the current step.
    Stayed,
    /// Nothing was re-checked; stay and keep any recorded error.
    Retained,
    /// Gate closed; surfaced through `error_message` only.
    Blocked(String),
    /// Gate closed; surfaced through `error_message` and a typed error.
    Rejected(String, TransitionError),
}

/// Owns every migration of this server and applies triggers to them.
///
/// Created at server start; call [`MigrationService::shutdown`] on the way out
/// to stop background provisioning loops.
pub struct MigrationService {
    store: Arc<dyn MigrationStore>,
    gate: CompatibilityGate,
    provisioning: Arc<dyn ProvisioningBackend>,
    processing: Arc<dyn MessageProcessing>,
    config: MigrationConfig,
    /// Serializes triggers per migration id.
    locks: DashMap<String, Arc<Mutex<()>>>,
    coordinators: DashMap<String, Arc<CertificateCoordinator>>,
    events: broadcast::Sender<MigrationState>,
}

impl MigrationService {
    pub fn new(
        store: Arc<dyn MigrationStore>,
        checker: Arc<dyn CompatibilityChecker>,
        provisioning: Arc<dyn ProvisioningBackend>,
        processing: Arc<dyn MessageProcessing>,
        config: MigrationConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            store,
            gate: CompatibilityGate::new(checker),
            provisioning,
            processing,
            config,
            locks: DashMap::new(),
            coordinators: DashMap::new(),
            events,
        }
    }

    /// Receive every persisted state change.
    pub fn subscribe(&self) -> broadcast::Receiver<MigrationState> {
        self.events.subscribe()
    }

    /// Create a migration at the start step. Returns the existing record if
    /// one is already stored under `id`.
    #[tracing::instrument(skip(self))]
    pub async fn create(&self, id: &str) -> Result<MigrationState, TransitionError> {
        validate_migration_id(id).map_err(|e| TransitionError::InvalidArgs(e.to_string()))?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.store.load(id).await? {
            debug!("migration already exists");
            return Ok(existing);
        }

        let state = MigrationState::new(id);
        self.store.save(&state).await?;
        info!(migration = %id, "migration created");
        self.publish(&state);
        Ok(state)
    }

    /// Current persisted state.
    pub async fn get(&self, id: &str) -> Result<Option<MigrationState>, TransitionError> {
        validate_migration_id(id).map_err(|e| TransitionError::InvalidArgs(e.to_string()))?;
        Ok(self.store.load(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<String>, TransitionError> {
        Ok(self.store.list_ids().await?)
    }

    /// Aggregate certificate status, if provisioning was ever started.
    pub async fn certificate_status(&self, id: &str) -> Option<AggregateStatus> {
        let coordinator = self.coordinators.get(id).map(|c| Arc::clone(c.value()))?;
        Some(coordinator.poll().await)
    }

    /// Per-node certificate records, if provisioning was ever started.
    pub async fn node_statuses(&self, id: &str) -> Option<Vec<NodeProvisioningStatus>> {
        let coordinator = self.coordinators.get(id).map(|c| Arc::clone(c.value()))?;
        Some(coordinator.statuses().await)
    }

    /// Status pushed by the provisioning backend for one node.
    pub async fn report_node_status(
        &self,
        id: &str,
        node_id: &str,
        phase: NodePhase,
    ) -> Result<(), ProvisioningError> {
        let coordinator = self
            .coordinators
            .get(id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| ProvisioningError::UnknownNode(node_id.to_string()))?;
        coordinator.report(node_id, phase).await
    }

    /// Restart provisioning loops for migrations persisted mid-provisioning.
    ///
    /// Returns how many coordinators were resumed.
    pub async fn recover(&self) -> Result<usize, TransitionError> {
        let mut resumed = 0;
        for id in self.store.list_ids().await? {
            let Some(state) = self.store.load(&id).await? else {
                continue;
            };
            let nodes = state.nodes();
            if state.state == Step::ProvisionCertificatesRunning && !nodes.is_empty() {
                self.coordinator(&id).start(nodes).await;
                resumed += 1;
            }
        }
        if resumed > 0 {
            info!(count = resumed, "resumed certificate provisioning");
        }
        Ok(resumed)
    }

    /// Stop every background provisioning loop.
    pub async fn shutdown(&self) {
        let coordinators: Vec<Arc<CertificateCoordinator>> = self
            .coordinators
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect();
        for coordinator in coordinators {
            coordinator.stop().await;
        }
        info!("migration service shut down");
    }

    /// Apply an operator trigger to migration `id`.
    ///
    /// Precondition failures that only need operator attention come back as
    /// `Ok` with `error_message` set. Protocol errors and confirmation / pause
    /// violations come back as `Err`.
    #[tracing::instrument(skip(self, trigger), fields(migration = %id, action = %trigger.action))]
    pub async fn trigger(
        &self,
        id: &str,
        trigger: Trigger,
    ) -> Result<MigrationState, TransitionError> {
        let action = Action::parse(&trigger.action)?;
        trigger.validate_args()?;
        if self.get(id).await?.is_none() {
            return Err(TransitionError::MigrationNotFound(id.to_string()));
        }

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut state = self
            .get(id)
            .await?
            .ok_or_else(|| TransitionError::MigrationNotFound(id.to_string()))?;
        let from = state.state;

        // Guards write their outputs after the caller's inputs are merged.
        let snapshot = state.clone();
        merge_args(&mut state, &trigger);
        let outcome = match Self::resolve(&snapshot, action, &trigger)? {
            Resolved::Replay => {
                debug!(step = %from, "replayed trigger, nothing to do");
                return Ok(snapshot);
            }
            Resolved::Advance { to, skip } => self.advance(&mut state, to, skip, &trigger).await?,
            Resolved::Retry => self.retry(&mut state, &trigger).await?,
            Resolved::EndPause => self.end_pause(&mut state, &trigger).await?,
        };

        match outcome {
            Outcome::Advanced(to) => {
                state.state = to;
                state.error_message = None;
                state.last_transition = Some(TransitionRecord {
                    from,
                    to,
                    action: action.to_string(),
                    at: Utc::now(),
                });
                self.commit(&mut state).await?;
                info!(from = %from, to = %to, "migration advanced");
                if to.is_terminal() {
                    self.retire_coordinator(id).await;
                }
                Ok(state)
            }
            Outcome::Stayed => {
                state.error_message = None;
                self.commit(&mut state).await?;
                debug!(step = %from, "trigger applied without transition");
                Ok(state)
            }
            Outcome::Retained => {
                self.commit(&mut state).await?;
                debug!(step = %from, stalled = state.is_stalled(), "nothing to re-check");
                Ok(state)
            }
            Outcome::Blocked(message) => self.stall(snapshot, message).await,
            Outcome::Rejected(message, error) => {
                self.stall(snapshot, message).await?;
                Err(error)
            }
        }
    }

    /// Check the action against the allow-list for the current step.
    fn resolve(
        state: &MigrationState,
        action: Action,
        trigger: &Trigger,
    ) -> Result<Resolved, TransitionError> {
        let from = state.state;
        let illegal = || TransitionError::IllegalTransition {
            from,
            action: action.to_string(),
        };
        let allowed = next_steps(from);

        // A trigger issued against an earlier step either repeats the
        // transition that left it or is stale.
        if let Some(expected) = trigger.expected_step()? {
            if expected != from {
                let repeats_last = state
                    .last_transition
                    .as_ref()
                    .is_some_and(|t| t.from == expected && t.to == from);
                return match action {
                    Action::Next if repeats_last => Ok(Resolved::Replay),
                    Action::Goto(to) if repeats_last && to == from => Ok(Resolved::Replay),
                    _ => Err(illegal()),
                };
            }
        }

        match action {
            Action::Next => allowed
                .first()
                .map(|&to| Resolved::Advance { to, skip: false })
                .ok_or_else(illegal),
            Action::Goto(to) if allowed.contains(&to) => Ok(Resolved::Advance { to, skip: false }),
            Action::Goto(to)
                if to == from
                    && state
                        .last_transition
                        .as_ref()
                        .is_some_and(|t| t.to == from) =>
            {
                Ok(Resolved::Replay)
            }
            Action::Goto(_) => Err(illegal()),
            Action::Retry => Ok(Resolved::Retry),
            Action::Skip if from == Step::CompatibilityCheck => Ok(Resolved::Advance {
                to: Step::ProvisionCertificates,
                skip: true,
            }),
            Action::EndPause if from == Step::MessageProcessingStop => Ok(Resolved::EndPause),
            Action::Skip | Action::EndPause => Err(illegal()),
        }
    }

    async fn advance(
        &self,
        state: &mut MigrationState,
        to: Step,
        skip: bool,
        trigger: &Trigger,
    ) -> Result<Outcome, TransitionError> {
        let outcome = match (state.state, to) {
            (Step::Welcome, Step::CompatibilityCheck) => Outcome::Advanced(to),

            (Step::CompatibilityCheck, Step::ProvisionCertificates) if skip => {
                if !trigger.confirmation()? {
                    return Ok(Outcome::Rejected(
                        "skipping the compatibility check requires confirmation".to_string(),
                        TransitionError::MissingConfirmation(Step::CompatibilityCheck),
                    ));
                }
                warn!(migration = %state.id, "compatibility check skipped by operator");
                state
                    .context
                    .insert(keys::COMPATIBILITY_SKIPPED.to_string(), Value::Bool(true));
                Outcome::Advanced(to)
            }

            (Step::CompatibilityCheck, Step::ProvisionCertificates) => {
                match self.run_compatibility_check(state, trigger).await? {
                    None => Outcome::Advanced(to),
                    Some(message) => Outcome::Blocked(message),
                }
            }

            (Step::ProvisionCertificates, Step::ProvisionCertificatesRunning) => {
                let nodes = match trigger.node_set()? {
                    Some(nodes) => nodes,
                    None => state.nodes(),
                };
                if nodes.is_empty() {
                    return Ok(Outcome::Blocked(
                        "no data nodes selected for certificate provisioning".to_string(),
                    ));
                }
                state.context.insert(keys::NODES.to_string(), json!(nodes));
                self.coordinator(&state.id).start(nodes).await;
                Outcome::Advanced(to)
            }

            (Step::ProvisionCertificatesRunning, Step::JournalDowntimeWarning) => {
                let status = self.certificate_gate(state).await;
                match status.blocking_reason() {
                    Some(reason) => Outcome::Blocked(reason),
                    None => {
                        record_estimate(state, trigger);
                        Outcome::Advanced(to)
                    }
                }
            }

            (Step::JournalDowntimeWarning, Step::MessageProcessingStop) => {
                if !trigger.confirmation()? {
                    return Ok(Outcome::Rejected(
                        "stopping message processing requires confirmation".to_string(),
                        TransitionError::MissingConfirmation(Step::JournalDowntimeWarning),
                    ));
                }
                match self.open_pause(state).await {
                    Some(message) => Outcome::Blocked(message),
                    None => Outcome::Advanced(to),
                }
            }

            (Step::MessageProcessingStop, Step::Restart) => {
                if state.pause.is_open() {
                    return Ok(Outcome::Rejected(
                        "message processing is still paused; end the pause before restarting"
                            .to_string(),
                        TransitionError::PauseStillOpen,
                    ));
                }
                Outcome::Advanced(to)
            }

            (from, _) => {
                return Err(TransitionError::IllegalTransition {
                    from,
                    action: to.to_string(),
                });
            }
        };
        Ok(outcome)
    }

    /// Re-enter the current step.
    async fn retry(
        &self,
        state: &mut MigrationState,
        trigger: &Trigger,
    ) -> Result<Outcome, TransitionError> {
        let outcome = match state.state {
            Step::CompatibilityCheck => match self.run_compatibility_check(state, trigger).await? {
                None => Outcome::Stayed,
                Some(message) => Outcome::Blocked(message),
            },
            Step::ProvisionCertificatesRunning => {
                let coordinator = self.coordinator(&state.id);
                let nodes = state.nodes();
                if !nodes.is_empty() {
                    coordinator.start(nodes).await;
                }
                coordinator.reprovision().await;
                match coordinator.poll().await.blocking_reason() {
                    Some(reason) => Outcome::Blocked(reason),
                    None => Outcome::Stayed,
                }
            }
            Step::JournalDowntimeWarning => {
                record_estimate(state, trigger);
                Outcome::Retained
            }
            Step::MessageProcessingStop => {
                if !trigger.confirmation()? {
                    return Ok(Outcome::Rejected(
                        "starting a new pause cycle requires confirmation".to_string(),
                        TransitionError::MissingConfirmation(Step::MessageProcessingStop),
                    ));
                }
                match self.open_pause(state).await {
                    Some(message) => Outcome::Blocked(message),
                    None => Outcome::Stayed,
                }
            }
            Step::Welcome | Step::ProvisionCertificates | Step::Restart => Outcome::Retained,
        };
        Ok(outcome)
    }

    /// Close the open pause cycle and resume processing.
    async fn end_pause(
        &self,
        state: &mut MigrationState,
        trigger: &Trigger,
    ) -> Result<Outcome, TransitionError> {
        let raw = trigger.pause_token()?.ok_or_else(|| {
            TransitionError::InvalidArgs("'pause_token' is required".to_string())
        })?;
        let token = PauseToken::parse(raw).map_err(|_| TransitionError::InvalidPauseToken)?;
        if state.pause.open_token() != Some(&token) {
            return Err(TransitionError::InvalidPauseToken);
        }

        if let Err(e) = self.processing.resume().await {
            warn!(migration = %state.id, error = %e, "failed to resume message processing");
            return Ok(Outcome::Blocked(format!(
                "failed to resume message processing: {}",
                e
            )));
        }
        state
            .pause
            .end_pause(&token)
            .map_err(|_| TransitionError::InvalidPauseToken)?;
        info!(migration = %state.id, "message processing resumed");
        Ok(Outcome::Stayed)
    }

    /// Run the compatibility gate. Returns the blocking message on failure.
    async fn run_compatibility_check(
        &self,
        state: &mut MigrationState,
        trigger: &Trigger,
    ) -> Result<Option<String>, TransitionError> {
        let installation = match trigger.installation()? {
            Some(installation) => installation.to_string(),
            None => state
                .context
                .get(keys::INSTALLATION)
                .and_then(Value::as_str)
                .unwrap_or(&state.id)
                .to_string(),
        };

        let result = self.gate.check(&installation).await;
        if !result.ok {
            return Ok(Some(
                result
                    .summary()
                    .unwrap_or_else(|| "compatibility check failed".to_string()),
            ));
        }

        let nodes = discovered_nodes(&result.node_info);
        if !nodes.is_empty() {
            state.context.insert(keys::NODES.to_string(), json!(nodes));
        }
        state.context.insert(
            keys::COMPATIBILITY.to_string(),
            json!({
                "detected_version": result.detected_version,
                "node_info": result.node_info,
            }),
        );
        state.context.remove(keys::COMPATIBILITY_SKIPPED);
        Ok(None)
    }

    /// Make sure provisioning runs for the recorded node set and read its status.
    async fn certificate_gate(&self, state: &MigrationState) -> AggregateStatus {
        let nodes = state.nodes();
        let coordinator = self.coordinator(&state.id);
        if !nodes.is_empty() {
            coordinator.start(nodes).await;
        }
        coordinator.poll().await
    }

    /// Pause processing and open a fresh pause cycle. Returns the blocking
    /// message if processing could not be paused.
    async fn open_pause(&self, state: &mut MigrationState) -> Option<String> {
        if let Err(e) = self.processing.pause().await {
            warn!(migration = %state.id, error = %e, "failed to pause message processing");
            return Some(format!("failed to pause message processing: {}", e));
        }
        let token = state.pause.begin_pause();
        info!(migration = %state.id, token = %token, "message processing paused");
        None
    }

    /// Persist `snapshot` with `message` as its error.
    async fn stall(
        &self,
        mut snapshot: MigrationState,
        message: String,
    ) -> Result<MigrationState, TransitionError> {
        warn!(migration = %snapshot.id, step = %snapshot.state, reason = %message, "migration stalled");
        snapshot.error_message = Some(message);
        self.commit(&mut snapshot).await?;
        Ok(snapshot)
    }

    async fn commit(&self, state: &mut MigrationState) -> Result<(), TransitionError> {
        state.updated_at = Utc::now();
        self.store.save(state).await?;
        self.publish(state);
        Ok(())
    }

    fn publish(&self, state: &MigrationState) {
        // No subscribers is fine.
        let _ = self.events.send(state.clone());
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(id.to_string()).or_default().value())
    }

    fn coordinator(&self, id: &str) -> Arc<CertificateCoordinator> {
        let entry = self.coordinators.entry(id.to_string()).or_insert_with(|| {
            Arc::new(CertificateCoordinator::new(
                id,
                Arc::clone(&self.provisioning),
                self.config.poll_interval,
                self.config.max_provisioning_attempts,
            ))
        });
        Arc::clone(entry.value())
    }

    async fn retire_coordinator(&self, id: &str) {
        if let Some((_, coordinator)) = self.coordinators.remove(id) {
            coordinator.stop().await;
        }
    }
}

/// Record the operator's inputs in the context. Per-trigger flags are never
/// kept and keys the engine owns are never overwritten.
fn merge_args(state: &mut MigrationState, trigger: &Trigger) {
    for (key, value) in &trigger.args {
        let key = key.as_str();
        if keys::TRANSIENT.contains(&key) {
            continue;
        }
        if keys::ENGINE_OWNED.contains(&key) {
            debug!(migration = %state.id, key, "ignoring engine-owned trigger arg");
            continue;
        }
        state.context.insert(key.to_string(), value.clone());
    }
}

/// Store the advisory downtime estimate when journal size and throughput are known.
fn record_estimate(state: &mut MigrationState, trigger: &Trigger) {
    let lookup = |key: &str| {
        trigger
            .args
            .get(key)
            .or_else(|| state.context.get(key))
            .and_then(Value::as_u64)
    };
    if let (Some(size), Some(throughput)) = (lookup(keys::JOURNAL_SIZE), lookup(keys::THROUGHPUT)) {
        let window = estimate_window(size, throughput);
        state.context.insert(
            keys::ESTIMATED_DOWNTIME.to_string(),
            json!(window.as_secs()),
        );
    }
}
