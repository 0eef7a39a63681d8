//! # Error Classification
//!
//! Every collaborator and provisioning step reports failures as a
//! [`ProvisionError`]. [`classify`] turns one into the [`StepOutcome`] the
//! engine acts on; nothing else inspects error kinds.

use std::fmt;
use std::time::Duration;

/// Coarse reason recorded on the FailedStart condition and in metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// The devfile or workspace definition is invalid
    BadRequest,
    /// Cluster infrastructure did not cooperate (storage, routing, RBAC, timeouts)
    InfrastructureFailure,
    /// The workload itself failed (crash loops, image pulls)
    WorkspaceEngineFailure,
    Unknown,
}

impl FailureReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::BadRequest => "BadRequest",
            FailureReason::InfrastructureFailure => "InfrastructureFailure",
            FailureReason::WorkspaceEngineFailure => "WorkspaceEngineFailure",
            FailureReason::Unknown => "Unknown",
        }
    }

    /// Parse a reason previously written to a condition
    #[must_use]
    pub fn from_condition_reason(reason: Option<&str>) -> Self {
        match reason {
            Some("BadRequest") => FailureReason::BadRequest,
            Some("InfrastructureFailure") => FailureReason::InfrastructureFailure,
            Some("WorkspaceEngineFailure") => FailureReason::WorkspaceEngineFailure,
            _ => FailureReason::Unknown,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by collaborators and provisioning steps
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Transient; try again after `delay`
    #[error("{message}")]
    Retry { message: String, delay: Duration },
    /// Terminal for this start attempt
    #[error("{message}")]
    Fail {
        message: String,
        reason: Option<FailureReason>,
    },
    /// Non-blocking; recorded in status and the pass continues
    #[error("{message}")]
    Warning { message: String },
    /// Anything else; surfaced to the controller's error policy
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProvisionError {
    pub fn retry(message: impl Into<String>, delay: Duration) -> Self {
        ProvisionError::Retry {
            message: message.into(),
            delay,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        ProvisionError::Fail {
            message: message.into(),
            reason: None,
        }
    }

    pub fn fail_with_reason(message: impl Into<String>, reason: FailureReason) -> Self {
        ProvisionError::Fail {
            message: message.into(),
            reason: Some(reason),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        ProvisionError::Warning {
            message: message.into(),
        }
    }
}

impl From<crate::cluster::StoreError> for ProvisionError {
    fn from(err: crate::cluster::StoreError) -> Self {
        ProvisionError::Other(anyhow::Error::new(err))
    }
}

/// What the engine does with a failed step
#[derive(Debug)]
pub enum StepOutcome {
    Retry {
        message: String,
        delay: Duration,
    },
    Fail {
        message: String,
        reason: FailureReason,
    },
    Warning {
        message: String,
    },
    Unclassified(anyhow::Error),
}

/// Classify a step failure
///
/// `context` prefixes Fail messages so the user sees which step failed
/// (`"Error provisioning storage: <cause>"`). `default_reason` applies when
/// the collaborator did not pick a reason itself.
#[must_use]
pub fn classify(err: ProvisionError, context: &str, default_reason: FailureReason) -> StepOutcome {
    match err {
        ProvisionError::Retry { message, delay } => StepOutcome::Retry { message, delay },
        ProvisionError::Fail { message, reason } => StepOutcome::Fail {
            message: if context.is_empty() {
                message
            } else {
                format!("{context}: {message}")
            },
            reason: reason.unwrap_or(default_reason),
        },
        ProvisionError::Warning { message } => StepOutcome::Warning { message },
        ProvisionError::Other(err) => StepOutcome::Unclassified(err.context(context.to_string())),
    }
}
