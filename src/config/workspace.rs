//! # Workspace Configuration
//!
//! Operator configuration consumed by the reconciliation engine: progress
//! timeout, stop policy, identity policy and workload defaults.

use std::time::Duration;

/// Operator configuration for workspaces
///
/// Snapshotted once at the start of every reconcile pass, so a hot reload
/// never changes behaviour half way through a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceConfig {
    /// Go-style duration (`"5m"`, `"1h30m"`) a workspace may spend in
    /// Starting without any condition changing
    pub progress_timeout: String,
    /// Delete owned objects on stop instead of scaling the workload to zero
    pub cleanup_on_stop: bool,
    /// Use `service_account_name` instead of creating a service account
    pub service_account_creation_disabled: bool,
    /// Service account used when creation is disabled
    pub service_account_name: String,
    /// Image of the project clone init container; empty disables cloning
    pub project_clone_image: String,
    /// Mount a persistent volume at the user's home directory
    pub persist_user_home: bool,
    /// Storage strategy used when the devfile does not select one
    pub default_storage_class_type: String,
    /// Whether the admission webhooks are deployed
    pub webhooks_enabled: bool,
    /// Timeout for the workload health probe (milliseconds, below one second)
    pub health_probe_timeout_ms: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            progress_timeout: DEFAULT_PROGRESS_TIMEOUT.to_string(),
            cleanup_on_stop: false,
            service_account_creation_disabled: false,
            service_account_name: String::new(),
            project_clone_image: String::new(),
            persist_user_home: false,
            default_storage_class_type: DEFAULT_STORAGE_CLASS_TYPE.to_string(),
            webhooks_enabled: false,
            health_probe_timeout_ms: DEFAULT_HEALTH_PROBE_TIMEOUT_MS,
        }
    }
}

impl WorkspaceConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(&super::env_lookup)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        use super::{value_or_default, value_or_default_bool, value_or_default_str};
        use crate::constants::*;
        let health_probe_timeout_ms: u64 = value_or_default(
            lookup,
            "WORKSPACE_HEALTH_PROBE_TIMEOUT_MS",
            DEFAULT_HEALTH_PROBE_TIMEOUT_MS,
        );
        Self {
            progress_timeout: value_or_default_str(
                lookup,
                "WORKSPACE_PROGRESS_TIMEOUT",
                DEFAULT_PROGRESS_TIMEOUT,
            ),
            cleanup_on_stop: value_or_default_bool(lookup, "WORKSPACE_CLEANUP_ON_STOP", false),
            service_account_creation_disabled: value_or_default_bool(
                lookup,
                "WORKSPACE_SERVICE_ACCOUNT_DISABLE_CREATION",
                false,
            ),
            service_account_name: value_or_default_str(
                lookup,
                "WORKSPACE_SERVICE_ACCOUNT_NAME",
                "",
            ),
            project_clone_image: value_or_default_str(lookup, "RELATED_IMAGE_PROJECT_CLONE", "")
                .trim()
                .to_string(),
            persist_user_home: value_or_default_bool(lookup, "WORKSPACE_PERSIST_USER_HOME", false),
            default_storage_class_type: value_or_default_str(
                lookup,
                "WORKSPACE_DEFAULT_STORAGE_CLASS_TYPE",
                DEFAULT_STORAGE_CLASS_TYPE,
            ),
            webhooks_enabled: value_or_default_bool(lookup, "WEBHOOKS_ENABLED", false),
            health_probe_timeout_ms: health_probe_timeout_ms.clamp(1, MAX_HEALTH_PROBE_TIMEOUT_MS),
        }
    }

    #[must_use]
    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health_probe_timeout_ms)
    }
}
