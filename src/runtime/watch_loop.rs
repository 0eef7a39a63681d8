//! # Watch Loop
//!
//! Controller watch loop that monitors DevWorkspace resources, the objects
//! they own and the cluster objects they depend on, and runs a reconcile pass
//! when something relevant changes.

use crate::config::SharedControllerConfig;
use crate::constants::{DEVWORKSPACE_ID_LABEL, DEVWORKSPACE_MOUNT_LABEL};
use crate::controller::events::{automount_targets, pvc_targets};
use crate::controller::reconciler::{Reconciler, ReconcilerError};
use crate::controller::server::ServerState;
use crate::crd::DevWorkspace;
use crate::observability::metrics;
use crate::runtime::error_policy::{handle_reconciliation_error, handle_watch_stream_error};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, ServiceAccount};
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{self, Action};
use kube_runtime::{watcher, Controller};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Instrument};

/// Run the controller watch loop until shutdown
///
/// The controller stream is restarted whenever it ends, unless the server
/// was marked not ready by a shutdown signal.
///
/// # Errors
///
/// Currently never fails; the signature leaves room for setup errors.
pub async fn run_watch_loop(
    client: Client,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
    controller_config: SharedControllerConfig,
) -> Result<(), anyhow::Error> {
    let config = controller_config.read().await;
    let backoff_start_ms = config.backoff_start_ms;
    drop(config);

    let backoff_duration_ms = Arc::new(AtomicU64::new(backoff_start_ms));

    let shutdown_server_state = Arc::clone(&server_state);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
        shutdown_server_state.set_ready(false);
        info!("Marked server as not ready, waiting for in-flight reconciliations to complete...");
    });

    loop {
        if !server_state.ready() {
            info!("Shutdown requested, exiting watch loop");
            break;
        }

        let config = controller_config.read().await;
        let concurrency = u16::try_from(config.max_concurrent_reconciliations).unwrap_or(u16::MAX);
        drop(config);

        let watch_span = tracing::span!(
            tracing::Level::INFO,
            "controller.watch",
            operation = "watch_loop"
        );

        let backoff = Arc::clone(&backoff_duration_ms);
        let config_for_filter = Arc::clone(&controller_config);
        build_controller(&client, &reconciler)
            .with_config(controller::Config::default().concurrency(concurrency))
            .shutdown_on_signal()
            .run(reconcile, handle_reconciliation_error, Arc::clone(&reconciler))
            .filter_map(move |x| {
                let backoff = Arc::clone(&backoff);
                let config = Arc::clone(&config_for_filter);
                async move {
                    match &x {
                        Ok(_) => {
                            let backoff_start = config.read().await.backoff_start_ms;
                            backoff.store(backoff_start, Ordering::Relaxed);
                            Some(x)
                        }
                        Err(e) => {
                            let error_string = format!("{e:?}");
                            let config = config.read().await;
                            let max_backoff = config.backoff_max_ms;
                            let restart_delay = config.watch_restart_delay_secs;
                            drop(config);
                            handle_watch_stream_error(
                                &error_string,
                                &backoff,
                                max_backoff,
                                restart_delay,
                            )
                            .await
                            .map(|()| x)
                        }
                    }
                }
            })
            .for_each(|_| futures::future::ready(()))
            .instrument(watch_span)
            .await;

        if !server_state.ready() {
            info!("Shutdown requested, exiting watch loop");
            break;
        }

        let delay_secs = controller_config
            .read()
            .await
            .watch_restart_delay_after_end_secs;
        warn!(
            "Controller watch stream ended, restarting in {} seconds...",
            delay_secs
        );
        tokio::time::sleep(Duration::from_secs(delay_secs)).await;
    }

    info!("Controller stopped gracefully");
    Ok(())
}

/// The controller with every owned and related watch attached
fn build_controller(client: &Client, reconciler: &Arc<Reconciler>) -> Controller<DevWorkspace> {
    let workspaces: Api<DevWorkspace> = Api::all(client.clone());
    let controller = Controller::new(workspaces, watcher::Config::default().any_semantic());
    let store = controller.store();
    let automount_store = store.clone();
    let automount_cm_store = store.clone();

    let owned = || watcher::Config::default().labels(DEVWORKSPACE_ID_LABEL);
    let automount = || watcher::Config::default().labels(&format!("{DEVWORKSPACE_MOUNT_LABEL}=true"));

    let pod_events = Arc::clone(&reconciler.events);

    controller
        .owns(Api::<Deployment>::all(client.clone()), owned())
        .owns(Api::<ConfigMap>::all(client.clone()), owned())
        .owns(Api::<Secret>::all(client.clone()), owned())
        .owns(Api::<ServiceAccount>::all(client.clone()), owned())
        .watches(
            Api::<Pod>::all(client.clone()),
            owned(),
            move |pod: Pod| pod_events.pod_event(&pod),
        )
        .watches(
            Api::<PersistentVolumeClaim>::all(client.clone()),
            watcher::Config::default(),
            move |pvc: PersistentVolumeClaim| pvc_targets(&pvc, &store.state()),
        )
        .watches(
            Api::<Secret>::all(client.clone()),
            automount(),
            move |secret: Secret| automount_targets(&secret.metadata, &automount_store.state()),
        )
        .watches(
            Api::<ConfigMap>::all(client.clone()),
            automount(),
            move |cm: ConfigMap| automount_targets(&cm.metadata, &automount_cm_store.state()),
        )
}

/// Reconcile entry point handed to the controller
async fn reconcile(
    workspace: Arc<DevWorkspace>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let name = workspace.name_any();
    let namespace = workspace.namespace().unwrap_or_default();

    if !ctx.events.workspace_should_reconcile(&workspace) {
        debug!(
            resource.name = name.as_str(),
            resource.namespace = namespace.as_str(),
            "Skipping reconciliation - failed workspace changed without a start/stop"
        );
        return Ok(Action::await_change());
    }

    let trigger = if workspace.metadata.deletion_timestamp.is_some() {
        "deletion"
    } else {
        "change"
    };
    let span = tracing::info_span!(
        "reconcile",
        resource.name = name.as_str(),
        resource.namespace = namespace.as_str(),
        trigger
    );

    async move {
        let started = Instant::now();
        metrics::increment_reconciliations();
        let result = ctx.reconcile_workspace(&namespace, &name).await;
        metrics::observe_reconciliation_duration(started.elapsed().as_secs_f64());

        let key = workspace.key();
        match result {
            Ok(result) => {
                if ctx.reset_backoff(&key) {
                    info!("✅ Reconciliation of {} recovered, backoff reset", key);
                }
                debug!(result = ?result, "watch.event.reconciled");
                Ok(result.into_action())
            }
            Err(e) => Err(e),
        }
    }
    .instrument(span)
    .await
}
