//! Error types for the migration engine.

use thiserror::Error;

use crate::catalog::Step;

/// Errors from the durable migration store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration id is not usable as a storage key.
    #[error("invalid migration id: {0}")]
    InvalidId(String),
}

/// Errors returned by a trigger.
///
/// Protocol errors (`IllegalTransition`, `UnknownStep`, `InvalidPauseToken`,
/// `InvalidArgs`) are rejected before any side effect. `MissingConfirmation`
/// and `PauseStillOpen` are precondition failures: the unchanged state is
/// persisted with the message before the error is returned. `Store` is the
/// only fatal variant.
#[derive(Debug, Error)]
pub enum TransitionError {
    /// The action is not a legal successor of the current step.
    #[error("illegal transition from {from} via '{action}'")]
    IllegalTransition { from: Step, action: String },

    /// The action names no known step or verb.
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// The step requires an explicit operator acknowledgement.
    #[error("step {0} requires explicit confirmation (args.confirmed = true)")]
    MissingConfirmation(Step),

    /// Restart was requested while ingestion is still paused.
    #[error("message processing is still paused; end the pause before restarting")]
    PauseStillOpen,

    /// The pause token is stale, foreign, or already closed.
    #[error("invalid pause token")]
    InvalidPauseToken,

    /// Trigger arguments have the wrong shape.
    #[error("invalid trigger arguments: {0}")]
    InvalidArgs(String),

    /// Migration does not exist.
    #[error("migration not found: {0}")]
    MigrationNotFound(String),

    /// Persistence failed; the migration state is indeterminate until re-read.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
