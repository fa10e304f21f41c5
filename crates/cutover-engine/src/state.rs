//! Migration state record and trigger types.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::{Step, parse_step};
use crate::downtime::DowntimeWindow;
use crate::error::{StoreError, TransitionError};

/// Maximum length of a migration id.
const MAX_ID_LEN: usize = 64;

/// Context keys written by the engine.
pub(crate) mod keys {
    pub const COMPATIBILITY: &str = "compatibility";
    pub const COMPATIBILITY_SKIPPED: &str = "compatibility_skipped";
    pub const NODES: &str = "nodes";
    pub const INSTALLATION: &str = "installation";
    pub const JOURNAL_SIZE: &str = "journal_size_bytes";
    pub const THROUGHPUT: &str = "throughput_bytes_per_sec";
    pub const ESTIMATED_DOWNTIME: &str = "estimated_downtime_secs";
    pub const CONFIRMED: &str = "confirmed";
    pub const PAUSE_TOKEN: &str = "pause_token";
    pub const FROM: &str = "from";

    /// Keys only the state machine writes. Caller args never overwrite them.
    pub const ENGINE_OWNED: [&str; 4] =
        [COMPATIBILITY, COMPATIBILITY_SKIPPED, NODES, ESTIMATED_DOWNTIME];

    /// Per-trigger arguments that are never kept in the context.
    pub const TRANSIENT: [&str; 3] = [CONFIRMED, PAUSE_TOKEN, FROM];
}

/// The persisted record of one cluster migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationState {
    pub id: String,
    pub state: Step,
    /// Last precondition failure. A migration carrying one is stalled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Accumulated step inputs and outputs.
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    /// Ingestion pause cycle.
    #[serde(default)]
    pub pause: DowntimeWindow,
    /// Transition that produced the current step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition: Option<TransitionRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationState {
    /// A fresh migration at the start step.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            state: Step::START,
            error_message: None,
            context: BTreeMap::new(),
            pause: DowntimeWindow::default(),
            last_transition: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_stalled(&self) -> bool {
        self.error_message.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_terminal() && !self.is_stalled()
    }

    /// Node set recorded in the context, if any.
    pub fn nodes(&self) -> BTreeSet<String> {
        self.context
            .get(keys::NODES)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Record of an applied transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Step,
    pub to: Step,
    pub action: String,
    pub at: DateTime<Utc>,
}

/// Parsed trigger action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Advance to the preferred successor.
    Next,
    /// Advance to a named successor.
    Goto(Step),
    /// Re-enter the current step.
    Retry,
    /// Bypass the compatibility gate with explicit confirmation.
    Skip,
    /// Close the open pause cycle.
    EndPause,
}

impl Action {
    pub fn parse(raw: &str) -> Result<Self, TransitionError> {
        match raw {
            "next" => Ok(Action::Next),
            "retry" => Ok(Action::Retry),
            "skip" => Ok(Action::Skip),
            "end_pause" | "end-pause" => Ok(Action::EndPause),
            other => parse_step(other).map(Action::Goto),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Next => f.write_str("next"),
            Action::Goto(step) => write!(f, "{}", step),
            Action::Retry => f.write_str("retry"),
            Action::Skip => f.write_str("skip"),
            Action::EndPause => f.write_str("end_pause"),
        }
    }
}

/// Operator request to attempt a transition. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub action: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl Trigger {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            args: Map::new(),
        }
    }

    /// Builder-style argument setter.
    pub fn with_arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    /// Shorthand for `with_arg("confirmed", true)`.
    pub fn confirmed(self) -> Self {
        self.with_arg(keys::CONFIRMED, true)
    }

    /// Check the shape of every argument the engine interprets.
    pub fn validate_args(&self) -> Result<(), TransitionError> {
        self.confirmation()?;
        self.node_set()?;
        self.pause_token()?;
        self.installation()?;
        self.expected_step()?;
        self.u64_arg(keys::JOURNAL_SIZE)?;
        self.u64_arg(keys::THROUGHPUT)?;
        Ok(())
    }

    /// Operator acknowledgement flag; absent means not confirmed.
    pub fn confirmation(&self) -> Result<bool, TransitionError> {
        match self.args.get(keys::CONFIRMED) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(TransitionError::InvalidArgs(
                "'confirmed' must be a boolean".to_string(),
            )),
        }
    }

    /// Explicit node set supplied by the operator.
    pub fn node_set(&self) -> Result<Option<BTreeSet<String>>, TransitionError> {
        let Some(value) = self.args.get(keys::NODES) else {
            return Ok(None);
        };
        let invalid = || TransitionError::InvalidArgs("'nodes' must be an array of strings".to_string());
        let items = value.as_array().ok_or_else(invalid)?;
        items
            .iter()
            .map(|item| item.as_str().map(String::from).ok_or_else(invalid))
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Some)
    }

    /// Step the operator issued the trigger against, if given.
    pub fn expected_step(&self) -> Result<Option<Step>, TransitionError> {
        self.string_arg(keys::FROM)?
            .map(|key| {
                parse_step(key).map_err(|_| {
                    TransitionError::InvalidArgs(format!("'from' names no step: {}", key))
                })
            })
            .transpose()
    }

    pub fn pause_token(&self) -> Result<Option<&str>, TransitionError> {
        self.string_arg(keys::PAUSE_TOKEN)
    }

    pub fn installation(&self) -> Result<Option<&str>, TransitionError> {
        self.string_arg(keys::INSTALLATION)
    }

    fn string_arg(&self, key: &str) -> Result<Option<&str>, TransitionError> {
        match self.args.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(TransitionError::InvalidArgs(format!(
                "'{}' must be a string",
                key
            ))),
        }
    }

    fn u64_arg(&self, key: &str) -> Result<Option<u64>, TransitionError> {
        match self.args.get(key) {
            None => Ok(None),
            Some(value) => value.as_u64().map(Some).ok_or_else(|| {
                TransitionError::InvalidArgs(format!("'{}' must be a non-negative integer", key))
            }),
        }
    }
}

/// Migration ids double as storage keys: `[A-Za-z0-9_-]{1,64}`.
pub fn validate_migration_id(id: &str) -> Result<(), StoreError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}
