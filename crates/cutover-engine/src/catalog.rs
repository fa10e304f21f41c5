//! Static catalog of migration steps.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TransitionError;

/// A step of the in-place migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    /// Introduction; nothing has been touched yet.
    Welcome,
    /// Verify the existing index directory can be taken over.
    CompatibilityCheck,
    /// Choose the node set and kick off certificate provisioning.
    ProvisionCertificates,
    /// Wait until every node has its certificate installed.
    ProvisionCertificatesRunning,
    /// Warn about the journal size and expected downtime.
    JournalDowntimeWarning,
    /// Message processing is paused for the journal cutover.
    MessageProcessingStop,
    /// Cluster processes restarted onto the data nodes.
    Restart,
}

/// Catalog entry as exposed to callers for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInfo {
    pub key: Step,
    pub description: String,
    pub next_steps: Vec<Step>,
}

impl Step {
    /// Every step in migration order.
    pub const ALL: [Step; 7] = [
        Step::Welcome,
        Step::CompatibilityCheck,
        Step::ProvisionCertificates,
        Step::ProvisionCertificatesRunning,
        Step::JournalDowntimeWarning,
        Step::MessageProcessingStop,
        Step::Restart,
    ];

    /// The step every migration starts in.
    pub const START: Step = Step::Welcome;

    /// The step a completed migration rests in.
    pub const TERMINAL: Step = Step::Restart;

    /// Stable key used on the wire and in storage.
    pub fn key(self) -> &'static str {
        match self {
            Step::Welcome => "welcome",
            Step::CompatibilityCheck => "compatibility-check",
            Step::ProvisionCertificates => "provision-certificates",
            Step::ProvisionCertificatesRunning => "provision-certificates-running",
            Step::JournalDowntimeWarning => "journal-downtime-warning",
            Step::MessageProcessingStop => "message-processing-stop",
            Step::Restart => "restart",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::TERMINAL
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Steps reachable from `step` in one transition, in preferred order.
pub fn next_steps(step: Step) -> &'static [Step] {
    match step {
        Step::Welcome => &[Step::CompatibilityCheck],
        Step::CompatibilityCheck => &[Step::ProvisionCertificates],
        Step::ProvisionCertificates => &[Step::ProvisionCertificatesRunning],
        Step::ProvisionCertificatesRunning => &[Step::JournalDowntimeWarning],
        Step::JournalDowntimeWarning => &[Step::MessageProcessingStop],
        Step::MessageProcessingStop => &[Step::Restart],
        Step::Restart => &[],
    }
}

/// Human-readable description of a step.
pub fn describe(step: Step) -> &'static str {
    match step {
        Step::Welcome => {
            "Migrate the existing search cluster in place onto data nodes running alongside each server."
        }
        Step::CompatibilityCheck => {
            "Check that the existing index directory and search engine version can be taken over by a data node."
        }
        Step::ProvisionCertificates => {
            "Select the data nodes taking part and request certificates for each of them."
        }
        Step::ProvisionCertificatesRunning => {
            "Certificates are being issued and installed; wait until every data node reports installed."
        }
        Step::JournalDowntimeWarning => {
            "Message processing will be paused while the journal is cut over; incoming messages queue in the journal."
        }
        Step::MessageProcessingStop => {
            "Message processing is paused. Replace the search cluster, then resume processing."
        }
        Step::Restart => "Restart every server so it connects to its co-located data node.",
    }
}

/// Older name of the certificate step, still accepted on input.
const CERTIFICATE_PROVISIONING_ALIAS: &str = "certificate-provisioning";

/// Resolve a step key.
pub fn parse_step(key: &str) -> Result<Step, TransitionError> {
    if key == CERTIFICATE_PROVISIONING_ALIAS {
        return Ok(Step::ProvisionCertificates);
    }
    Step::ALL
        .iter()
        .copied()
        .find(|s| s.key() == key)
        .ok_or_else(|| TransitionError::UnknownStep(key.to_string()))
}

/// The full catalog in migration order.
pub fn catalog() -> Vec<StepInfo> {
    Step::ALL
        .iter()
        .map(|&key| StepInfo {
            key,
            description: describe(key).to_string(),
            next_steps: next_steps(key).to_vec(),
        })
        .collect()
}
