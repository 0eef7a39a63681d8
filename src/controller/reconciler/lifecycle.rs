//! # Stop Path and Failure Handling
//!
//! Everything a pass does for a workspace that should not be running:
//! suspending routing, scaling the workload to zero (or deleting owned
//! objects when cleanup-on-stop is enabled), and stopping a workspace whose
//! start attempt failed.

use crate::config::WorkspaceConfig;
use crate::constants::{DEVWORKSPACE_DEBUG_START_ANNOTATION, DEVWORKSPACE_STOP_REASON_ANNOTATION};
use crate::controller::reconciler::cleanup::delete_owned_objects;
use crate::controller::reconciler::conditions::{ObservedCondition, StatusTracker};
use crate::controller::reconciler::errors::{classify, FailureReason, ProvisionError, StepOutcome};
use crate::controller::reconciler::timeout::{check_failing_timeout, FailingTimeout};
use crate::controller::reconciler::types::{
    PassOutcome, ReconcileResult, Reconciler, ReconcilerError,
};
use crate::crd::{condition_types, DevWorkspace, Phase};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Requeue delay while the workload scales down
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

impl Reconciler {
    /// Handle a Failing workspace that is still marked started
    ///
    /// With the debug annotation set, the workspace is held in Failing until
    /// the progress timeout has passed since it failed, so its pod logs can
    /// be inspected.
    pub(crate) async fn handle_failing(
        &self,
        workspace: &DevWorkspace,
        config: &WorkspaceConfig,
    ) -> PassOutcome {
        let key = workspace.key();
        let persisted = workspace.status.clone().unwrap_or_default();
        let mut tracker = StatusTracker::new(Phase::Failing);
        carry_failed_start(workspace, &mut tracker);

        if workspace.annotation(DEVWORKSPACE_DEBUG_START_ANNOTATION) == Some("true") {
            match check_failing_timeout(&persisted, &config.progress_timeout, self.clock.now()) {
                Ok(FailingTimeout::Holding { remaining }) => {
                    debug!(
                        "Holding failed DevWorkspace {} for debugging ({}s left)",
                        key,
                        remaining.as_secs()
                    );
                    return PassOutcome::flush(tracker, ReconcileResult::RequeueAfter(remaining));
                }
                Ok(FailingTimeout::Expired | FailingTimeout::NotFailing) => {}
                Err(err) => warn!("Ending debug hold for {}: {}", key, err),
            }
        }

        match self.store.set_started(workspace, false).await {
            Ok(()) => {
                info!("⏹️  Stopping failed DevWorkspace {}", key);
                PassOutcome::skip_flush(ReconcileResult::RequeueNow)
            }
            Err(err) if err.is_conflict() => {
                info!("Conflict stopping failed DevWorkspace {}; retrying", key);
                PassOutcome::skip_flush(ReconcileResult::RequeueNow)
            }
            Err(err) if err.is_not_found() => PassOutcome::skip_flush(ReconcileResult::Done),
            Err(err) => PassOutcome::error(tracker, err),
        }
    }

    /// Stop a workspace whose `spec.started` is false
    pub(crate) async fn stop_workspace(
        &self,
        workspace: &DevWorkspace,
        config: &WorkspaceConfig,
    ) -> PassOutcome {
        let key = workspace.key();
        if let Some(reason) = workspace.annotation(DEVWORKSPACE_STOP_REASON_ANNOTATION) {
            debug!("DevWorkspace {} stopped by {}", key, reason);
        }

        let persisted_phase = workspace.status.as_ref().and_then(|s| s.phase);
        let failed = matches!(persisted_phase, Some(Phase::Failing | Phase::Failed));
        let mut tracker = StatusTracker::new(Phase::Stopping);
        if failed {
            carry_failed_start(workspace, &mut tracker);
        }

        if let Err(err) = self.provisioners.routing.suspend(workspace).await {
            if let Some(result) = stop_step_error(&mut tracker, err, "Error suspending routing") {
                return PassOutcome {
                    status: Some(tracker),
                    result,
                };
            }
        }

        if config.cleanup_on_stop {
            match delete_owned_objects(self.store.as_ref(), workspace).await {
                Ok(0) => {}
                Ok(deleted) => {
                    debug!("Deleted {} object(s) for stopping DevWorkspace {}", deleted, key);
                    tracker.set_condition_false(condition_types::STARTED, "Workspace is stopping");
                    return PassOutcome::flush(tracker, ReconcileResult::RequeueNow);
                }
                Err(err) => return PassOutcome::error(tracker, err),
            }
        } else {
            match self.provisioners.workload.scale_to_zero(workspace).await {
                Ok(true) => {}
                Ok(false) => {
                    tracker.set_condition_false(condition_types::STARTED, "Workspace is stopping");
                    return PassOutcome::flush(
                        tracker,
                        ReconcileResult::RequeueAfter(STOP_POLL_INTERVAL),
                    );
                }
                Err(err) => {
                    if let Some(result) =
                        stop_step_error(&mut tracker, err, "Error scaling workload to zero")
                    {
                        return PassOutcome {
                            status: Some(tracker),
                            result,
                        };
                    }
                }
            }
        }

        if failed {
            tracker.set_phase(Phase::Failed);
            tracker.set_condition_false(condition_types::STARTED, "Workspace stopped due to error");
        } else {
            if persisted_phase != Some(Phase::Stopped) {
                info!("⏹️  DevWorkspace {} stopped", key);
            }
            tracker.set_phase(Phase::Stopped);
            tracker.set_condition_false(condition_types::STARTED, "Workspace is stopped");
        }
        PassOutcome::flush(tracker, ReconcileResult::Done)
    }
}

/// Keep the FailedStart condition of a failed workspace visible
fn carry_failed_start(workspace: &DevWorkspace, tracker: &mut StatusTracker) {
    if let Some(failed) = workspace
        .status
        .as_ref()
        .and_then(|s| s.condition(condition_types::FAILED_START))
    {
        tracker.set_condition(
            condition_types::FAILED_START,
            ObservedCondition::from_persisted(failed),
        );
    }
}

/// Classify a failure while stopping; `None` means carry on stopping
fn stop_step_error(
    tracker: &mut StatusTracker,
    err: ProvisionError,
    context: &str,
) -> Option<Result<ReconcileResult, ReconcilerError>> {
    match classify(err, context, FailureReason::InfrastructureFailure) {
        StepOutcome::Retry { message, delay } => {
            tracker.set_condition_false(condition_types::STARTED, message);
            Some(Ok(ReconcileResult::RequeueAfter(delay)))
        }
        StepOutcome::Fail { message, .. } => {
            tracker.set_phase(Phase::Error);
            tracker.set_condition_true(condition_types::ERROR, message);
            Some(Ok(ReconcileResult::Done))
        }
        StepOutcome::Warning { message } => {
            tracker.add_warning(message, None);
            None
        }
        StepOutcome::Unclassified(err) => Some(Err(err.into())),
    }
}
