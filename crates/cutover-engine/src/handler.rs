//! Operator-facing trigger protocol.
//!
//! Wraps [`MigrationService`] with the request/response shapes served over
//! HTTP and maps engine errors to `{ status, code, message }` rejections.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::catalog::{Step, describe, next_steps};
use crate::certificates::AggregateStatus;
use crate::error::{StoreError, TransitionError};
use crate::machine::MigrationService;
use crate::state::{MigrationState, Trigger};

/// Body of `POST /migration/{id}/trigger`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub action: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl From<TriggerRequest> for Trigger {
    fn from(req: TriggerRequest) -> Self {
        Trigger {
            action: req.action,
            args: req.args,
        }
    }
}

/// What an operator sees of a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationView {
    pub id: String,
    pub state: Step,
    pub description: String,
    pub next_steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub context: BTreeMap<String, Value>,
    /// Token of the open pause cycle, needed to end it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<AggregateStatus>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationView {
    pub fn new(state: &MigrationState, certificates: Option<AggregateStatus>) -> Self {
        Self {
            id: state.id.clone(),
            state: state.state,
            description: describe(state.state).to_string(),
            next_steps: next_steps(state.state).to_vec(),
            error_message: state.error_message.clone(),
            context: state.context.clone(),
            pause_token: state.pause.open_token().map(|t| t.to_string()),
            certificates,
            updated_at: state.updated_at,
        }
    }
}

/// Successful trigger answer: the resulting state view.
pub type TriggerResponse = MigrationView;

/// Trigger failure as returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct TriggerRejection {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl TriggerRejection {
    fn new(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<TransitionError> for TriggerRejection {
    fn from(err: TransitionError) -> Self {
        let message = err.to_string();
        match err {
            TransitionError::IllegalTransition { .. } => {
                Self::new(409, "illegal_transition", message)
            }
            TransitionError::UnknownStep(_) => Self::new(400, "unknown_step", message),
            TransitionError::MissingConfirmation(_) => {
                Self::new(422, "missing_confirmation", message)
            }
            TransitionError::PauseStillOpen => Self::new(409, "pause_still_open", message),
            TransitionError::InvalidPauseToken => Self::new(409, "invalid_pause_token", message),
            TransitionError::InvalidArgs(_) => Self::new(400, "invalid_args", message),
            TransitionError::MigrationNotFound(_) => Self::new(404, "migration_not_found", message),
            TransitionError::Store(StoreError::InvalidId(_)) => {
                Self::new(400, "invalid_args", message)
            }
            TransitionError::Store(_) => Self::new(500, "store_error", message),
        }
    }
}

/// Thin adapter between callers and the state machine.
#[derive(Clone)]
pub struct TriggerHandler {
    service: Arc<MigrationService>,
}

impl TriggerHandler {
    pub fn new(service: Arc<MigrationService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<MigrationService> {
        &self.service
    }

    /// Apply a trigger and return the resulting view.
    pub async fn handle(
        &self,
        id: &str,
        request: TriggerRequest,
    ) -> Result<TriggerResponse, TriggerRejection> {
        if request.action.trim().is_empty() {
            return Err(TriggerRejection::new(400, "invalid_args", "'action' is required"));
        }
        let trigger = Trigger::from(request);
        trigger.validate_args()?;

        if self.service.get(id).await?.is_none() {
            return Err(TransitionError::MigrationNotFound(id.to_string()).into());
        }

        let state = self.service.trigger(id, trigger).await?;
        Ok(self.render(&state).await)
    }

    /// Create a migration, or return the existing one.
    pub async fn create(&self, id: &str) -> Result<MigrationView, TriggerRejection> {
        let state = self.service.create(id).await?;
        Ok(self.render(&state).await)
    }

    /// Current view of a migration.
    pub async fn view(&self, id: &str) -> Result<MigrationView, TriggerRejection> {
        let state = self
            .service
            .get(id)
            .await?
            .ok_or_else(|| TransitionError::MigrationNotFound(id.to_string()))?;
        Ok(self.render(&state).await)
    }

    /// View of a state taken from the event stream.
    pub async fn render(&self, state: &MigrationState) -> MigrationView {
        let certificates = self.service.certificate_status(&state.id).await;
        MigrationView::new(state, certificates)
    }
}
