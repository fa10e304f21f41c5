//! Stateful property testing for the trigger protocol.
//!
//! Uses proptest-state-machine to drive a real `MigrationService` with random
//! operator triggers, checker answers and certificate reports, and compares
//! it against a reference model of the step graph:
//!
//! - Illegal and unknown actions never change the stored state
//! - Gates that are not met stall the migration in place
//! - Only the current pause token can end a pause
//! - Restart is never reached while processing is paused
//! - Retry only clears a stall when the re-run check passes

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use proptest::sample::select;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use serde_json::json;
use tokio::runtime::Runtime;

use cutover_engine::{
    CheckerError, CompatibilityChecker, CompatibilityReport, InMemoryProvisioningBackend,
    MemoryStore, MigrationConfig, MigrationService, MigrationStore, NodePhase,
    RecordingMessageProcessing, Step, TransitionError, Trigger, next_steps,
};

const MIGRATION: &str = "m";
const NODES: [&str; 2] = ["n1", "n2"];

/// Which token an `end_pause` trigger carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenChoice {
    /// Token of the open cycle, or the last issued one if none is open.
    Current,
    /// Token of an earlier cycle, or a foreign one.
    Stale,
    /// Not a token at all.
    Garbage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelAction {
    Next,
    Goto(Step),
    Retry,
    Skip,
    EndPause(TokenChoice),
    Bogus,
}

/// Operations that can be performed against a migration.
#[derive(Debug, Clone)]
pub enum MigrationOperation {
    /// Change what the compatibility checker answers.
    SetCompatible(bool),
    /// Backend reports a node's certificate as installed.
    Install(usize),
    /// Operator trigger.
    Trigger { action: ModelAction, confirmed: bool },
}

/// Kind of result a trigger produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Outcome {
    #[default]
    Ok,
    Illegal,
    Unknown,
    MissingConfirmation,
    PauseStillOpen,
    InvalidToken,
}

/// Reference model of one migration.
#[derive(Clone, Debug)]
pub struct MigrationModel {
    step: Step,
    compatible: bool,
    provisioning: bool,
    installed: [bool; 2],
    pause_open: bool,
    pauses_issued: usize,
    last_to: Option<Step>,
    stalled: bool,
    outcome: Outcome,
}

impl Default for MigrationModel {
    fn default() -> Self {
        Self {
            step: Step::Welcome,
            compatible: true,
            provisioning: false,
            installed: [false; 2],
            pause_open: false,
            pauses_issued: 0,
            last_to: None,
            stalled: false,
            outcome: Outcome::Ok,
        }
    }
}

impl MigrationModel {
    fn successor(&self) -> Option<Step> {
        next_steps(self.step).first().copied()
    }

    fn advance_to(&mut self, to: Step) {
        self.step = to;
        self.stalled = false;
        self.last_to = Some(to);
    }

    fn reject(&mut self, outcome: Outcome) {
        self.stalled = true;
        self.outcome = outcome;
    }

    fn open_pause(&mut self) {
        self.pause_open = true;
        self.pauses_issued += 1;
    }

    fn advance(&mut self, to: Step, skip: bool, confirmed: bool) {
        match (self.step, to) {
            (Step::CompatibilityCheck, Step::ProvisionCertificates) if skip => {
                if confirmed {
                    self.advance_to(to);
                } else {
                    self.reject(Outcome::MissingConfirmation);
                }
            }
            (Step::CompatibilityCheck, Step::ProvisionCertificates) => {
                if self.compatible {
                    self.advance_to(to);
                } else {
                    self.stalled = true;
                }
            }
            (Step::ProvisionCertificates, Step::ProvisionCertificatesRunning) => {
                self.provisioning = true;
                self.advance_to(to);
            }
            (Step::ProvisionCertificatesRunning, Step::JournalDowntimeWarning) => {
                if self.installed.iter().all(|i| *i) {
                    self.advance_to(to);
                } else {
                    self.stalled = true;
                }
            }
            (Step::JournalDowntimeWarning, Step::MessageProcessingStop) => {
                if confirmed {
                    self.open_pause();
                    self.advance_to(to);
                } else {
                    self.reject(Outcome::MissingConfirmation);
                }
            }
            (Step::MessageProcessingStop, Step::Restart) => {
                if self.pause_open {
                    self.reject(Outcome::PauseStillOpen);
                } else {
                    self.provisioning = false;
                    self.advance_to(to);
                }
            }
            _ => self.advance_to(to),
        }
    }

    fn retry(&mut self, confirmed: bool) {
        match self.step {
            Step::CompatibilityCheck => self.stalled = !self.compatible,
            Step::MessageProcessingStop => {
                if confirmed {
                    self.open_pause();
                    self.stalled = false;
                } else {
                    self.reject(Outcome::MissingConfirmation);
                }
            }
            Step::ProvisionCertificatesRunning => {
                self.stalled = !self.installed.iter().all(|i| *i);
            }
            // Nothing to re-check; the recorded error stays.
            Step::Welcome
            | Step::ProvisionCertificates
            | Step::JournalDowntimeWarning
            | Step::Restart => {}
        }
    }

    fn trigger(&mut self, action: ModelAction, confirmed: bool) {
        self.outcome = Outcome::Ok;
        match action {
            ModelAction::Bogus => self.outcome = Outcome::Unknown,
            ModelAction::Next => match self.successor() {
                Some(to) => self.advance(to, false, confirmed),
                None => self.outcome = Outcome::Illegal,
            },
            ModelAction::Goto(to) if self.successor() == Some(to) => {
                self.advance(to, false, confirmed)
            }
            // Replay of the transition that entered the current step.
            ModelAction::Goto(to) if to == self.step && self.last_to == Some(to) => {}
            ModelAction::Goto(_) => self.outcome = Outcome::Illegal,
            ModelAction::Retry => self.retry(confirmed),
            ModelAction::Skip if self.step == Step::CompatibilityCheck => {
                self.advance(Step::ProvisionCertificates, true, confirmed)
            }
            ModelAction::EndPause(choice) if self.step == Step::MessageProcessingStop => {
                if choice == TokenChoice::Current && self.pause_open {
                    self.pause_open = false;
                    self.stalled = false;
                } else {
                    self.outcome = Outcome::InvalidToken;
                }
            }
            ModelAction::Skip | ModelAction::EndPause(_) => self.outcome = Outcome::Illegal,
        }
    }
}

fn action_strategy() -> BoxedStrategy<ModelAction> {
    prop_oneof![
        4 => Just(ModelAction::Next),
        2 => select(Step::ALL.to_vec()).prop_map(ModelAction::Goto),
        1 => Just(ModelAction::Retry),
        1 => Just(ModelAction::Skip),
        2 => select(vec![TokenChoice::Current, TokenChoice::Stale, TokenChoice::Garbage])
            .prop_map(ModelAction::EndPause),
        1 => Just(ModelAction::Bogus),
    ]
    .boxed()
}

impl ReferenceStateMachine for MigrationModel {
    type State = Self;
    type Transition = MigrationOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        prop_oneof![
            1 => any::<bool>().prop_map(MigrationOperation::SetCompatible),
            2 => (0usize..NODES.len()).prop_map(MigrationOperation::Install),
            8 => (action_strategy(), any::<bool>())
                .prop_map(|(action, confirmed)| MigrationOperation::Trigger { action, confirmed }),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            MigrationOperation::SetCompatible(ok) => {
                state.compatible = *ok;
                state.outcome = Outcome::Ok;
            }
            MigrationOperation::Install(i) => {
                if state.provisioning {
                    state.installed[*i] = true;
                }
                state.outcome = Outcome::Ok;
            }
            MigrationOperation::Trigger { action, confirmed } => {
                state.trigger(*action, *confirmed);
            }
        }
        state
    }
}

/// Checker whose verdict is flipped by the test.
struct ToggleChecker {
    compatible: AtomicBool,
}

#[async_trait]
impl CompatibilityChecker for ToggleChecker {
    async fn check(&self, _installation: &str) -> Result<CompatibilityReport, CheckerError> {
        let errors = if self.compatible.load(Ordering::SeqCst) {
            vec![]
        } else {
            vec!["index created by an unsupported version".to_string()]
        };
        Ok(CompatibilityReport {
            compatibility_errors: errors,
            opensearch_version: Some("2.11.1".to_string()),
            info: json!({ "nodes": NODES }),
        })
    }
}

/// Test harness that wraps the real service with a tokio runtime.
pub struct MigrationTestHarness {
    runtime: Runtime,
    service: MigrationService,
    store: Arc<MemoryStore>,
    checker: Arc<ToggleChecker>,
    processing: Arc<RecordingMessageProcessing>,
    /// Every pause token handed out so far.
    tokens: Vec<String>,
}

impl MigrationTestHarness {
    fn new() -> Self {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        let store = Arc::new(MemoryStore::new());
        let checker = Arc::new(ToggleChecker {
            compatible: AtomicBool::new(true),
        });
        let processing = Arc::new(RecordingMessageProcessing::new());
        let config = MigrationConfig {
            poll_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let service = MigrationService::new(
            store.clone(),
            checker.clone(),
            Arc::new(InMemoryProvisioningBackend::new()),
            processing.clone(),
            config,
        );
        runtime
            .block_on(service.create(MIGRATION))
            .expect("create migration");
        Self {
            runtime,
            service,
            store,
            checker,
            processing,
            tokens: Vec::new(),
        }
    }

    fn token_for(&self, choice: TokenChoice) -> String {
        match choice {
            TokenChoice::Current => self
                .tokens
                .last()
                .cloned()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            TokenChoice::Stale => match self.tokens.len() {
                0 | 1 => uuid::Uuid::new_v4().to_string(),
                n => self.tokens[n - 2].clone(),
            },
            TokenChoice::Garbage => "not-a-token".to_string(),
        }
    }

    fn build_trigger(&self, action: ModelAction, confirmed: bool) -> Trigger {
        let name = match action {
            ModelAction::Next => "next".to_string(),
            ModelAction::Goto(step) => step.key().to_string(),
            ModelAction::Retry => "retry".to_string(),
            ModelAction::Skip => "skip".to_string(),
            ModelAction::EndPause(_) => "end_pause".to_string(),
            ModelAction::Bogus => "jump-to-the-end".to_string(),
        };
        let mut trigger = Trigger::new(name)
            .with_arg("confirmed", confirmed)
            .with_arg("nodes", json!(NODES));
        if let ModelAction::EndPause(choice) = action {
            trigger = trigger.with_arg("pause_token", self.token_for(choice));
        }
        trigger
    }

    fn apply_operation(&mut self, op: &MigrationOperation) -> Outcome {
        match op {
            MigrationOperation::SetCompatible(ok) => {
                self.checker.compatible.store(*ok, Ordering::SeqCst);
                Outcome::Ok
            }
            MigrationOperation::Install(i) => {
                // Unknown migration or node before provisioning starts is fine.
                let _ = self.runtime.block_on(self.service.report_node_status(
                    MIGRATION,
                    NODES[*i],
                    NodePhase::Installed,
                ));
                Outcome::Ok
            }
            MigrationOperation::Trigger { action, confirmed } => {
                let before = self.stored();
                let trigger = self.build_trigger(*action, *confirmed);
                let result = self.runtime.block_on(self.service.trigger(MIGRATION, trigger));
                let outcome = match &result {
                    Ok(_) => Outcome::Ok,
                    Err(TransitionError::IllegalTransition { .. }) => Outcome::Illegal,
                    Err(TransitionError::UnknownStep(_)) => Outcome::Unknown,
                    Err(TransitionError::MissingConfirmation(_)) => Outcome::MissingConfirmation,
                    Err(TransitionError::PauseStillOpen) => Outcome::PauseStillOpen,
                    Err(TransitionError::InvalidPauseToken) => Outcome::InvalidToken,
                    Err(other) => panic!("unexpected error: {other}"),
                };
                if matches!(
                    outcome,
                    Outcome::Illegal | Outcome::Unknown | Outcome::InvalidToken
                ) {
                    assert_eq!(self.stored(), before, "protocol error must not touch state");
                }
                if let Ok(state) = result {
                    assert_eq!(self.stored(), state, "returned state must be the stored one");
                    if let Some(token) = state.pause.open_token() {
                        let token = token.to_string();
                        if self.tokens.last() != Some(&token) {
                            self.tokens.push(token);
                        }
                    }
                }
                outcome
            }
        }
    }

    fn stored(&self) -> cutover_engine::MigrationState {
        self.runtime
            .block_on(self.store.load(MIGRATION))
            .expect("load")
            .expect("migration exists")
    }

    fn verify_invariants(&self, model: &MigrationModel) {
        let state = self.stored();
        assert_eq!(state.state, model.step, "step diverged from model");
        assert_eq!(state.is_stalled(), model.stalled, "stall flag diverged");
        assert_eq!(state.pause.is_open(), model.pause_open, "pause window diverged");
        let pauses = self
            .processing
            .calls()
            .iter()
            .filter(|c| **c == "pause")
            .count();
        assert_eq!(pauses, model.pauses_issued, "processing pause calls diverged");
        if state.state == Step::Restart {
            assert!(!state.pause.is_open(), "restart reached with processing paused");
        }
    }
}

impl StateMachineTest for MigrationTestHarness {
    type SystemUnderTest = Self;
    type Reference = MigrationModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        let outcome = state.apply_operation(&transition);
        assert_eq!(outcome, ref_state.outcome, "outcome diverged for {transition:?}");
        state.verify_invariants(ref_state);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        state.verify_invariants(ref_state);
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 10000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn trigger_protocol_state_machine_test(sequential 1..60 => MigrationTestHarness);
}

// Targeted sequences

#[test]
fn test_model_reaches_restart() {
    let mut model = MigrationModel::default();
    model.trigger(ModelAction::Next, false);
    model.trigger(ModelAction::Next, false);
    model.trigger(ModelAction::Next, false);
    model.installed = [true, true];
    model.trigger(ModelAction::Next, false);
    model.trigger(ModelAction::Next, true);
    assert!(model.pause_open);
    model.trigger(ModelAction::Next, false);
    assert_eq!(model.outcome, Outcome::PauseStillOpen);
    model.trigger(ModelAction::EndPause(TokenChoice::Current), false);
    model.trigger(ModelAction::Next, false);
    assert_eq!(model.step, Step::Restart);
    assert!(!model.stalled);
}
