//! Engine configuration.

use std::time::Duration;

/// Default interval between certificate status refreshes.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default number of failed provisioning attempts before a node is reported failed.
const DEFAULT_MAX_PROVISIONING_ATTEMPTS: u32 = 3;

/// Default timeout for collaborator HTTP calls.
const DEFAULT_CHECK_TIMEOUT_SECS: u64 = 30;

/// Capacity of the state change broadcast channel.
const DEFAULT_EVENT_BUFFER: usize = 100;

/// Tunables for [`crate::MigrationService`].
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// How often each certificate coordinator refreshes node status.
    pub poll_interval: Duration,
    /// Failed attempts per node before giving up until re-provisioned.
    pub max_provisioning_attempts: u32,
    /// Timeout for compatibility, provisioning and processing requests.
    pub check_timeout: Duration,
    /// State change events buffered per subscriber.
    pub event_buffer: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_provisioning_attempts: DEFAULT_MAX_PROVISIONING_ATTEMPTS,
            check_timeout: Duration::from_secs(DEFAULT_CHECK_TIMEOUT_SECS),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}
