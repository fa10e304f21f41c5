//! Migration orchestration engine for moving a log-indexing cluster onto
//! co-located data nodes.
//!
//! This crate provides a server-resident state machine that:
//! - Walks an operator through a fixed catalog of migration steps
//! - Refuses to advance past a step whose safety gate is unmet
//! - Coordinates certificate provisioning across data nodes until convergence
//! - Guards the ingestion pause window used for the journal cutover
//! - Persists every transition so a crash resumes from the last saved step

mod catalog;
mod certificates;
mod config;
mod downtime;
mod error;
mod gate;
mod handler;
pub mod http;
mod machine;
mod state;
mod store;

pub use catalog::{Step, StepInfo, catalog, describe, next_steps, parse_step};
pub use certificates::{
    AggregateStatus, CertificateCoordinator, InMemoryProvisioningBackend, NodePhase,
    NodeProvisioningStatus, ProvisioningBackend, ProvisioningError,
};
pub use config::MigrationConfig;
pub use downtime::{
    DowntimeError, DowntimeWindow, MessageProcessing, PauseToken, ProcessingError,
    RecordingMessageProcessing, estimate_window,
};
pub use error::{StoreError, TransitionError};
pub use gate::{
    CheckerError, CompatibilityChecker, CompatibilityGate, CompatibilityReport,
    CompatibilityResult, discovered_nodes,
};
pub use handler::{
    MigrationView, TriggerHandler, TriggerRejection, TriggerRequest, TriggerResponse,
};
pub use machine::MigrationService;
pub use state::{Action, MigrationState, TransitionRecord, Trigger, validate_migration_id};
pub use store::{FileStore, MemoryStore, MigrationStore};
