//! # Configuration
//!
//! Controller, server and workspace configuration.
//!
//! All three load through the same key lookup so environment variables and
//! ConfigMap data share one parser. Shared handles are `Arc<RwLock<_>>` and
//! are hot-reloaded by [`start_configmap_watch`].

mod controller;
mod server;
mod watch;
mod workspace;

pub use controller::ControllerConfig;
pub use server::ServerConfig;
pub use watch::{reload_from_data, start_configmap_watch};
pub use workspace::WorkspaceConfig;

use std::sync::Arc;
use tokio::sync::RwLock;

pub type SharedControllerConfig = Arc<RwLock<ControllerConfig>>;
pub type SharedServerConfig = Arc<RwLock<ServerConfig>>;
pub type SharedWorkspaceConfig = Arc<RwLock<WorkspaceConfig>>;

/// Shared configuration handles, loaded from the environment
#[derive(Debug, Clone)]
pub struct SharedConfig {
    pub controller: SharedControllerConfig,
    pub server: SharedServerConfig,
    pub workspace: SharedWorkspaceConfig,
}

/// Create shared (hot-reloadable) configuration from environment variables
#[must_use]
pub fn create_shared_config() -> SharedConfig {
    SharedConfig {
        controller: Arc::new(RwLock::new(ControllerConfig::from_env())),
        server: Arc::new(RwLock::new(ServerConfig::from_env())),
        workspace: Arc::new(RwLock::new(WorkspaceConfig::from_env())),
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Read a value or return default value
fn value_or_default<T: std::str::FromStr>(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Read a value as boolean or return default
fn value_or_default_bool(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> bool {
    lookup(key)
        .map(|v| {
            let v_lower = v.trim().to_lowercase();
            v_lower == "true" || v_lower == "1" || v_lower == "yes" || v_lower == "on"
        })
        .unwrap_or(default)
}

/// Read a value as string or return default
fn value_or_default_str(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: &str,
) -> String {
    lookup(key).unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_workspace_config_defaults() {
        let lookup = lookup_from(&[]);
        let config = WorkspaceConfig::from_lookup(&lookup);
        assert_eq!(config, WorkspaceConfig::default());
        assert_eq!(config.progress_timeout, "5m");
        assert!(!config.cleanup_on_stop);
    }

    #[test]
    fn test_workspace_config_overrides() {
        let lookup = lookup_from(&[
            ("WORKSPACE_PROGRESS_TIMEOUT", "10m"),
            ("WORKSPACE_CLEANUP_ON_STOP", "yes"),
            ("WORKSPACE_SERVICE_ACCOUNT_DISABLE_CREATION", "ON"),
            ("WORKSPACE_SERVICE_ACCOUNT_NAME", "shared-sa"),
            ("WORKSPACE_HEALTH_PROBE_TIMEOUT_MS", "5000"),
        ]);
        let config = WorkspaceConfig::from_lookup(&lookup);
        assert_eq!(config.progress_timeout, "10m");
        assert!(config.cleanup_on_stop);
        assert!(config.service_account_creation_disabled);
        assert_eq!(config.service_account_name, "shared-sa");
        assert_eq!(
            config.health_probe_timeout_ms, 999,
            "health probe timeout must stay below one second"
        );
    }

    #[test]
    fn test_bool_parsing() {
        let test_cases = vec![
            ("true", true),
            ("1", true),
            ("yes", true),
            ("on", true),
            ("TRUE", true),
            ("false", false),
            ("0", false),
            ("nope", false),
        ];
        for (value, expected) in test_cases {
            let lookup = lookup_from(&[("KEY", value)]);
            assert_eq!(
                value_or_default_bool(&lookup, "KEY", !expected),
                expected,
                "value '{value}' should parse as {expected}"
            );
        }
    }

    #[test]
    fn test_unparsable_numbers_fall_back_to_default() {
        let lookup = lookup_from(&[("METRICS_PORT", "not-a-port")]);
        let config = ServerConfig::from_lookup(&lookup);
        assert_eq!(config.metrics_port, crate::constants::DEFAULT_METRICS_PORT);
    }

    #[test]
    fn test_controller_config_from_lookup() {
        let lookup = lookup_from(&[
            ("MAX_CONCURRENT_RECONCILIATIONS", "3"),
            ("POD_NAMESPACE", "dw-system"),
        ]);
        let config = ControllerConfig::from_lookup(&lookup);
        assert_eq!(config.max_concurrent_reconciliations, 3);
        assert_eq!(config.controller_namespace, "dw-system");
        assert_eq!(config.backoff_start_ms, crate::constants::DEFAULT_BACKOFF_START_MS);
    }
}
