//! # Initialization
//!
//! Controller initialization logic including rustls setup, tracing, metrics,
//! server startup, Kubernetes client setup and construction of the engine.

use crate::config::{create_shared_config, start_configmap_watch, SharedConfig, SharedServerConfig};
use crate::controller::reconciler::{HttpHealthProbe, Reconciler};
use crate::controller::server::{start_server, ServerState};
use crate::crd::DevWorkspace;
use crate::observability::{self, PrometheusMetrics};
use crate::provision::basic::{
    default_storage_registry, BasicRouting, KubeAccessController, KubeAutomount,
    KubeDeploymentWorkload, KubeIdentity, KubePullSecrets, KubeSubResources, PassthroughResolver,
};
use crate::provision::{Provisioners, SystemClock};
use crate::cluster::KubeWorkspaceStore;
use anyhow::{Context, Result};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Dependencies whose logs are capped at `warn`
const NOISY_TARGETS: [&str; 3] = ["kube_runtime", "hyper", "tower"];

/// Initialization result containing all necessary components for the controller
pub struct InitializationResult {
    /// Kubernetes client
    pub client: Client,
    /// Reconciler context
    pub reconciler: Arc<Reconciler>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
    /// Shared configuration (hot-reloadable)
    pub config: SharedConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.ready())
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

/// Filter directives for the tracing subscriber
///
/// `RUST_LOG` wins when set; otherwise the configured log level applies to
/// everything. Noisy dependencies are capped at `warn` unless `RUST_LOG`
/// names them itself.
#[must_use]
pub fn filter_directives(rust_log: Option<&str>, log_level: &str) -> String {
    let base = match rust_log.map(str::trim) {
        Some(directives) if !directives.is_empty() => directives.to_string(),
        _ => log_level.trim().to_lowercase(),
    };
    let mut directives = vec![base.clone()];
    for target in NOISY_TARGETS {
        if !base.contains(target) {
            directives.push(format!("{target}=warn"));
        }
    }
    directives.join(",")
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Reconciler setup
/// - Configuration ConfigMap watch
///
/// # Errors
///
/// Fails when metrics cannot be registered, the server does not come up, the
/// cluster is unreachable, or the health probe client cannot be built.
pub async fn initialize() -> Result<InitializationResult> {
    // Required for rustls 0.23+ when no default provider is set via features
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        return Err(anyhow::anyhow!("Failed to install rustls crypto provider"));
    }

    let config = create_shared_config();

    let log_level = config.controller.read().await.log_level.clone();
    let rust_log = std::env::var("RUST_LOG").ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter_directives(
            rust_log.as_deref(),
            &log_level,
        )))
        .init();

    info!("Starting DevWorkspace controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::default());
    let server_port = config.server.read().await.metrics_port;
    let server_state_clone = Arc::clone(&server_state);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, Arc::clone(&config.server)).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let reconciler = Arc::new(build_reconciler(&client, &config).await?);

    summarize_existing_workspaces(&client).await;

    let controller_config = config.controller.read().await.clone();
    start_configmap_watch(
        client.clone(),
        &controller_config.controller_namespace,
        &controller_config.config_map_name,
        config.clone(),
    );

    info!("Controller initialized, starting watch loop...");

    Ok(InitializationResult {
        client,
        reconciler,
        server_state,
        config,
    })
}

/// Engine with the in-process collaborators
async fn build_reconciler(client: &Client, config: &SharedConfig) -> Result<Reconciler> {
    let probe_timeout = config.workspace.read().await.health_probe_timeout();
    let health = HttpHealthProbe::new(probe_timeout).context("Failed to build health probe")?;

    let provisioners = Provisioners {
        resolver: Arc::new(PassthroughResolver),
        storage: default_storage_registry(client),
        access: Arc::new(KubeAccessController::new(client.clone())),
        routing: Arc::new(BasicRouting::new(client.clone())),
        identity: Arc::new(KubeIdentity::new(client.clone())),
        pull_secrets: Arc::new(KubePullSecrets::new(client.clone())),
        automount: Arc::new(KubeAutomount::new(client.clone())),
        sub_resources: Arc::new(KubeSubResources::new(client.clone())),
        workload: Arc::new(KubeDeploymentWorkload::new(client.clone())),
        health: Arc::new(health),
        metrics: Arc::new(PrometheusMetrics),
    };

    let controller_config = config.controller.read().await;
    Ok(Reconciler::new(
        Arc::new(KubeWorkspaceStore::new(client.clone())),
        provisioners,
        Arc::new(SystemClock),
        Arc::clone(&config.workspace),
    )
    .with_backoff(
        controller_config.backoff_start_ms,
        controller_config.backoff_max_ms,
    ))
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    server_config: SharedServerConfig,
) -> Result<()> {
    let config = server_config.read().await;
    let startup_timeout = config.startup_timeout();
    let poll_interval = config.poll_interval();
    drop(config);
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }

        if server_state.ready() {
            info!("HTTP server is ready and accepting connections");
            break;
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }

    Ok(())
}

/// Log the DevWorkspaces present at startup, per namespace
///
/// Also checks that the CRD is queryable; the watch loop retries on its own
/// if it is not.
async fn summarize_existing_workspaces(client: &Client) {
    let workspaces: Api<DevWorkspace> = Api::all(client.clone());
    match workspaces.list(&ListParams::default()).await {
        Ok(list) => {
            let mut by_namespace: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for workspace in &list.items {
                by_namespace
                    .entry(workspace.namespace().unwrap_or_default())
                    .or_default()
                    .push(workspace.name_any());
            }
            info!(
                "Found {} existing DevWorkspaces in {} namespaces",
                list.items.len(),
                by_namespace.len()
            );
            for (namespace, mut names) in by_namespace {
                names.sort();
                let shown = if names.len() <= 3 {
                    names.join(", ")
                } else {
                    format!("{}, ... ({} total)", names[..3].join(", "), names.len())
                };
                info!("  {}: {}", namespace, shown);
            }
        }
        Err(e) => {
            error!("DevWorkspace CRD is not queryable: {}. Is the CRD installed?", e);
            warn!("Continuing despite CRD queryability check failure - controller will retry");
        }
    }
}
