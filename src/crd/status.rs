//! # DevWorkspace Status
//!
//! Status types: phase, identifier, main URL, summary message and the
//! ordered condition list.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of the DevWorkspace resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DevWorkspaceStatus {
    /// Identifier allocated on the first pass; never changes afterwards
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub devworkspace_id: String,
    /// URL of the workspace's main endpoint
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub main_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    /// Conditions, sorted by fixed priority after every write
    #[serde(default)]
    pub conditions: Vec<DevWorkspaceCondition>,
    /// Single human-readable summary of the current state
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Workspace lifecycle phase
///
/// `Failing` and `Terminating` are internal phases: they are persisted so
/// the next pass can pick up where this one stopped, but are transient.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, schemars::JsonSchema,
)]
pub enum Phase {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failing,
    Failed,
    Error,
    Terminating,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Starting => "Starting",
            Phase::Running => "Running",
            Phase::Stopping => "Stopping",
            Phase::Stopped => "Stopped",
            Phase::Failing => "Failing",
            Phase::Failed => "Failed",
            Phase::Error => "Error",
            Phase::Terminating => "Terminating",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tri-state condition status
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema,
)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// A typed, timestamped observation about the workspace
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DevWorkspaceCondition {
    #[serde(rename = "type")]
    pub r#type: String,
    pub status: ConditionStatus,
    /// RFC3339 timestamp of the last status/message/reason change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DevWorkspaceStatus {
    /// Persisted condition of the given type
    #[must_use]
    pub fn condition(&self, condition_type: &str) -> Option<&DevWorkspaceCondition> {
        self.conditions.iter().find(|c| c.r#type == condition_type)
    }
}

/// Condition types written by the controller
pub mod condition_types {
    pub const STARTED: &str = "Started";
    pub const DEVWORKSPACE_RESOLVED: &str = "DevWorkspaceResolved";
    pub const STORAGE_READY: &str = "StorageReady";
    pub const ROUTING_READY: &str = "RoutingReady";
    pub const SERVICE_ACCOUNT_READY: &str = "ServiceAccountReady";
    pub const PULL_SECRETS_READY: &str = "PullSecretsReady";
    pub const KUBE_COMPONENTS_READY: &str = "KubeComponentsReady";
    pub const DEPLOYMENT_READY: &str = "DeploymentReady";
    pub const READY: &str = "Ready";
    pub const FAILED_START: &str = "FailedStart";
    pub const ERROR: &str = "Error";
    pub const WARNING: &str = "DevWorkspaceWarning";

    /// Order in which provisioning checkpoints are reached
    pub const PRIORITY_ORDER: [&str; 9] = [
        STARTED,
        DEVWORKSPACE_RESOLVED,
        STORAGE_READY,
        ROUTING_READY,
        SERVICE_ACCOUNT_READY,
        PULL_SECRETS_READY,
        KUBE_COMPONENTS_READY,
        DEPLOYMENT_READY,
        READY,
    ];

    /// Position in [`PRIORITY_ORDER`]; `-1` for types outside it
    #[must_use]
    pub fn priority(condition_type: &str) -> i32 {
        PRIORITY_ORDER
            .iter()
            .position(|t| *t == condition_type)
            .and_then(|idx| i32::try_from(idx).ok())
            .unwrap_or(-1)
    }
}
