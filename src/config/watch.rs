//! # ConfigMap Watch
//!
//! Watches for ConfigMap changes and hot-reloads controller configuration.

use crate::config::{ControllerConfig, ServerConfig, SharedConfig, WorkspaceConfig};
use futures::{pin_mut, StreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use kube_runtime::watcher;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

/// Start watching for ConfigMap changes and hot-reload configuration
///
/// Watches the named ConfigMap in the controller namespace. Keys are the
/// environment variable names, case-insensitive. Deleting the ConfigMap
/// reverts to environment/defaults. Running passes keep the snapshot they
/// started with; the next pass sees the new values.
pub fn start_configmap_watch(
    client: kube::Client,
    namespace: &str,
    configmap_name: &str,
    config: SharedConfig,
) {
    let namespace = namespace.to_string();
    let configmap_name = configmap_name.to_string();
    tokio::spawn(async move {
        let configmaps: Api<ConfigMap> = Api::namespaced(client, &namespace);

        info!(
            "Starting watch for ConfigMap '{}' in namespace '{}'",
            configmap_name, namespace
        );

        let watcher_config =
            watcher::Config::default().fields(&format!("metadata.name={configmap_name}"));

        let stream = watcher(configmaps, watcher_config);
        pin_mut!(stream);

        while let Some(event_result) = stream.next().await {
            match event_result {
                Ok(watcher::Event::Apply(configmap) | watcher::Event::InitApply(configmap)) => {
                    if configmap.metadata.name.as_deref() == Some(configmap_name.as_str()) {
                        info!("ConfigMap '{}' changed, reloading configuration", configmap_name);
                        apply_reload(&config, configmap.data.as_ref()).await;
                    }
                }
                Ok(watcher::Event::Delete(configmap)) => {
                    if configmap.metadata.name.as_deref() == Some(configmap_name.as_str()) {
                        warn!(
                            "ConfigMap '{}' was deleted, reverting to defaults",
                            configmap_name
                        );
                        apply_reload(&config, None).await;
                    }
                }
                Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
                Err(e) => {
                    // The watcher retries on its own
                    error!("Error watching ConfigMap: {}", e);
                }
            }
        }

        warn!("ConfigMap watch stream ended");
    });
}

async fn apply_reload(config: &SharedConfig, data: Option<&BTreeMap<String, String>>) {
    let (controller, server, workspace) = reload_from_data(data);

    *config.controller.write().await = controller.clone();
    *config.server.write().await = server;
    *config.workspace.write().await = workspace.clone();

    info!(
        progress_timeout = workspace.progress_timeout.as_str(),
        cleanup_on_stop = workspace.cleanup_on_stop,
        backoff_start_ms = controller.backoff_start_ms,
        backoff_max_ms = controller.backoff_max_ms,
        "Configuration reloaded"
    );
}

/// Build fresh configuration from ConfigMap data layered over the environment
///
/// ConfigMap keys are upper-cased before lookup, so `workspace_progress_timeout`
/// and `WORKSPACE_PROGRESS_TIMEOUT` are equivalent.
#[must_use]
pub fn reload_from_data(
    data: Option<&BTreeMap<String, String>>,
) -> (ControllerConfig, ServerConfig, WorkspaceConfig) {
    let overrides: BTreeMap<String, String> = data
        .into_iter()
        .flatten()
        .map(|(k, v)| (k.to_uppercase(), v.clone()))
        .collect();
    let lookup = |key: &str| {
        overrides
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
    };
    (
        ControllerConfig::from_lookup(&lookup),
        ServerConfig::from_lookup(&lookup),
        WorkspaceConfig::from_lookup(&lookup),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reload_uppercases_configmap_keys() {
        let data = BTreeMap::from([
            ("workspace_progress_timeout".to_string(), "15m".to_string()),
            ("WORKSPACE_CLEANUP_ON_STOP".to_string(), "true".to_string()),
        ]);
        let (_, _, workspace) = reload_from_data(Some(&data));
        assert_eq!(workspace.progress_timeout, "15m");
        assert!(workspace.cleanup_on_stop);
    }
}
