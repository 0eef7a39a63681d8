//! # Finalization
//!
//! Cleanup for a workspace pending deletion. One finalizer is handled per
//! pass: the first entry of the workspace's finalizer list that this
//! controller owns. Each handler is idempotent and either removes its
//! finalizer or asks for another pass.
//!
//! A cleanup that fails outright moves the workspace to the Error phase and
//! keeps the finalizer. The pass then returns without an error, so the
//! failure is not retried in a tight loop; fixing it takes user or operator
//! action.

use crate::config::WorkspaceConfig;
use crate::constants::{
    RBAC_CLEANUP_FINALIZER, SERVICE_ACCOUNT_CLEANUP_FINALIZER, STORAGE_CLEANUP_FINALIZER,
};
use crate::controller::reconciler::conditions::StatusTracker;
use crate::controller::reconciler::errors::{classify, FailureReason, ProvisionError, StepOutcome};
use crate::controller::reconciler::types::{PassOutcome, ReconcileResult, Reconciler};
use crate::crd::{condition_types, DevWorkspace, Phase};
use std::ops::ControlFlow;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Finalizers handled by this controller
pub const KNOWN_FINALIZERS: [&str; 3] = [
    STORAGE_CLEANUP_FINALIZER,
    RBAC_CLEANUP_FINALIZER,
    SERVICE_ACCOUNT_CLEANUP_FINALIZER,
];

/// Requeue delay while the workload is being deleted
const WORKLOAD_DELETE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// First finalizer in the workspace's list that this controller handles
#[must_use]
pub fn next_finalizer(workspace: &DevWorkspace) -> Option<&str> {
    workspace
        .finalizers()
        .iter()
        .map(String::as_str)
        .find(|f| KNOWN_FINALIZERS.contains(f))
}

/// Apply the classifier's decision for a failed cleanup
///
/// `Continue` means the finalizer can be removed anyway.
fn on_cleanup_error(
    tracker: &mut StatusTracker,
    err: ProvisionError,
    context: &str,
) -> ControlFlow<Result<ReconcileResult, anyhow::Error>> {
    match classify(err, context, FailureReason::InfrastructureFailure) {
        StepOutcome::Retry { message, delay } => {
            debug!("{} (retrying in {:?})", message, delay);
            ControlFlow::Break(Ok(ReconcileResult::RequeueAfter(delay)))
        }
        StepOutcome::Fail { message, .. } => {
            warn!("{}", message);
            tracker.set_phase(Phase::Error);
            tracker.set_condition_true(condition_types::ERROR, message);
            ControlFlow::Break(Ok(ReconcileResult::Done))
        }
        StepOutcome::Warning { message } => {
            tracker.add_warning(message, None);
            ControlFlow::Continue(())
        }
        StepOutcome::Unclassified(err) => ControlFlow::Break(Err(err)),
    }
}

fn ended(tracker: StatusTracker, result: Result<ReconcileResult, anyhow::Error>) -> PassOutcome {
    PassOutcome {
        status: Some(tracker),
        result: result.map_err(Into::into),
    }
}

impl Reconciler {
    /// Handle the next finalizer of a workspace pending deletion
    pub(crate) async fn finalize(
        &self,
        workspace: &DevWorkspace,
        config: &WorkspaceConfig,
    ) -> PassOutcome {
        let Some(finalizer) = next_finalizer(workspace) else {
            return PassOutcome::skip_flush(ReconcileResult::Done);
        };
        let mut tracker = StatusTracker::new(Phase::Terminating);
        tracker.set_condition_true(condition_types::STARTED, "Cleaning up resources for deletion");

        match finalizer {
            STORAGE_CLEANUP_FINALIZER => self.finalize_storage(workspace, config, tracker).await,
            RBAC_CLEANUP_FINALIZER => self.finalize_rbac(workspace, tracker).await,
            _ => self.finalize_service_account(workspace, tracker).await,
        }
    }

    async fn finalize_storage(
        &self,
        workspace: &DevWorkspace,
        config: &WorkspaceConfig,
        mut tracker: StatusTracker,
    ) -> PassOutcome {
        const CONTEXT: &str = "Failed to clean up DevWorkspace storage";

        match self.provisioners.workload.delete(workspace).await {
            Ok(true) => {
                debug!("Waiting for workload of {} to be deleted", workspace.key());
                return PassOutcome::flush(
                    tracker,
                    ReconcileResult::RequeueAfter(WORKLOAD_DELETE_POLL_INTERVAL),
                );
            }
            Ok(false) => {}
            Err(err) => {
                if let ControlFlow::Break(result) = on_cleanup_error(&mut tracker, err, CONTEXT) {
                    return ended(tracker, result);
                }
            }
        }

        match self.namespace_terminating(workspace).await {
            Ok(true) => {
                info!(
                    "Namespace of {} is terminating; skipping storage cleanup",
                    workspace.key()
                );
                return self
                    .remove_finalizer(workspace, tracker, STORAGE_CLEANUP_FINALIZER)
                    .await;
            }
            Ok(false) => {}
            Err(err) => return PassOutcome::error(tracker, err),
        }

        let cleanup = match self
            .provisioners
            .storage
            .for_template(&workspace.spec.template, &config.default_storage_class_type)
        {
            Ok(storage) => storage.cleanup_storage(workspace).await,
            Err(err) => Err(err),
        };
        if let Err(err) = cleanup {
            if let ControlFlow::Break(result) = on_cleanup_error(&mut tracker, err, CONTEXT) {
                return ended(tracker, result);
            }
        }
        self.remove_finalizer(workspace, tracker, STORAGE_CLEANUP_FINALIZER)
            .await
    }

    async fn finalize_rbac(&self, workspace: &DevWorkspace, mut tracker: StatusTracker) -> PassOutcome {
        match self.namespace_terminating(workspace).await {
            Ok(true) => {
                return self
                    .remove_finalizer(workspace, tracker, RBAC_CLEANUP_FINALIZER)
                    .await;
            }
            Ok(false) => {}
            Err(err) => return PassOutcome::error(tracker, err),
        }
        if let Err(err) = self.provisioners.access.finalize(workspace).await {
            if let ControlFlow::Break(result) =
                on_cleanup_error(&mut tracker, err, "Failed to clean up DevWorkspace RBAC")
            {
                return ended(tracker, result);
            }
        }
        self.remove_finalizer(workspace, tracker, RBAC_CLEANUP_FINALIZER)
            .await
    }

    async fn finalize_service_account(
        &self,
        workspace: &DevWorkspace,
        mut tracker: StatusTracker,
    ) -> PassOutcome {
        match self.provisioners.identity.finalize_legacy(workspace).await {
            Ok(true) => PassOutcome::flush(tracker, ReconcileResult::RequeueNow),
            Ok(false) => {
                self.remove_finalizer(workspace, tracker, SERVICE_ACCOUNT_CLEANUP_FINALIZER)
                    .await
            }
            Err(err) => match on_cleanup_error(
                &mut tracker,
                err,
                "Failed to clean up DevWorkspace service account",
            ) {
                ControlFlow::Break(result) => ended(tracker, result),
                ControlFlow::Continue(()) => {
                    self.remove_finalizer(workspace, tracker, SERVICE_ACCOUNT_CLEANUP_FINALIZER)
                        .await
                }
            },
        }
    }

    async fn namespace_terminating(
        &self,
        workspace: &DevWorkspace,
    ) -> Result<bool, crate::cluster::StoreError> {
        let namespace = workspace.metadata.namespace.as_deref().unwrap_or_default();
        self.store.namespace_terminating(namespace).await
    }

    /// Remove `finalizer`; status is not written once none remain
    async fn remove_finalizer(
        &self,
        workspace: &DevWorkspace,
        tracker: StatusTracker,
        finalizer: &str,
    ) -> PassOutcome {
        let remaining: Vec<String> = workspace
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();
        match self.store.set_finalizers(workspace, &remaining).await {
            Ok(()) => {
                info!("🧹 Removed finalizer {} from {}", finalizer, workspace.key());
            }
            Err(err) if err.is_not_found() => {
                return PassOutcome::skip_flush(ReconcileResult::Done);
            }
            Err(err) if err.is_conflict() => {
                info!("Conflict removing finalizer from {}; retrying", workspace.key());
                return PassOutcome::skip_flush(ReconcileResult::RequeueNow);
            }
            Err(err) => return PassOutcome::error(tracker, err),
        }
        if remaining.is_empty() {
            PassOutcome::skip_flush(ReconcileResult::Done)
        } else {
            PassOutcome::flush(tracker, ReconcileResult::RequeueNow)
        }
    }
}
