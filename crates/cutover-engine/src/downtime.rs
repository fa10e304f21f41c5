//! Ingestion pause window for the journal cutover.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors from the pause window.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DowntimeError {
    /// Token is not the one issued by the most recent open pause.
    #[error("invalid pause token")]
    InvalidPauseToken,
}

/// Errors from the message-processing collaborator.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server refused the request.
    #[error("processing control failed: {0}")]
    Rejected(String),
}

/// Handle proving which pause cycle is open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PauseToken(Uuid);

impl PauseToken {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a token sent back by a caller. Malformed input never matches.
    pub fn parse(raw: &str) -> Result<Self, DowntimeError> {
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|_| DowntimeError::InvalidPauseToken)
    }
}

impl fmt::Display for PauseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Pause cycle state of one migration. Persisted alongside the migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DowntimeWindow {
    current: Option<PauseToken>,
    open: bool,
    opened_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
}

impl DowntimeWindow {
    /// Open a new pause cycle. Any earlier token stops being valid.
    pub fn begin_pause(&mut self) -> PauseToken {
        let token = PauseToken::generate();
        self.current = Some(token.clone());
        self.open = true;
        self.opened_at = Some(Utc::now());
        self.closed_at = None;
        token
    }

    /// Close the pause cycle identified by `token`.
    pub fn end_pause(&mut self, token: &PauseToken) -> Result<(), DowntimeError> {
        match &self.current {
            Some(current) if self.open && current == token => {
                self.open = false;
                self.closed_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(DowntimeError::InvalidPauseToken),
        }
    }

    /// True while ingestion is paused.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Token of the open cycle, if any.
    pub fn open_token(&self) -> Option<&PauseToken> {
        self.current.as_ref().filter(|_| self.open)
    }

    /// How long the current or last cycle lasted.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let opened = self.opened_at?;
        Some(self.closed_at.unwrap_or_else(Utc::now) - opened)
    }
}

/// Advisory downtime estimate for draining `journal_size_bytes` at
/// `throughput_bytes_per_sec`. Rounds up to whole seconds.
pub fn estimate_window(journal_size_bytes: u64, throughput_bytes_per_sec: u64) -> Duration {
    let throughput = throughput_bytes_per_sec.max(1);
    Duration::from_secs(journal_size_bytes.div_ceil(throughput))
}

/// Pauses and resumes message processing on the cluster.
#[async_trait]
pub trait MessageProcessing: Send + Sync {
    async fn pause(&self) -> Result<(), ProcessingError>;
    async fn resume(&self) -> Result<(), ProcessingError>;
}

/// In-process [`MessageProcessing`] that records calls.
#[derive(Debug, Default)]
pub struct RecordingMessageProcessing {
    calls: Mutex<Vec<&'static str>>,
}

impl RecordingMessageProcessing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls seen so far, as `"pause"` / `"resume"`.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: &'static str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl MessageProcessing for RecordingMessageProcessing {
    async fn pause(&self) -> Result<(), ProcessingError> {
        self.record("pause");
        Ok(())
    }

    async fn resume(&self) -> Result<(), ProcessingError> {
        self.record("resume");
        Ok(())
    }
}
