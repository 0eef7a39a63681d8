//! # Reconcile Pass
//!
//! Entry point of the engine. A pass walks a fixed sequence of gates, each
//! of which may end it:
//!
//! 1. the workspace no longer exists
//! 2. it is being deleted: finalization
//! 3. it has no identifier yet: allocation
//! 4. it is Failing but still started: stop it (or hold it for debugging)
//! 5. it is not started: stop path
//! 6. it is not Starting/Running yet: mark it Starting
//! 7. the provisioning pipeline
//!
//! Every exit from gates 4 to 7 goes through [`Reconciler::finalize_pass`],
//! which applies the start timeout and writes status at most once.

use crate::config::WorkspaceConfig;
use crate::constants::DEVWORKSPACE_STOP_REASON_ANNOTATION;
use crate::controller::reconciler::conditions::StatusTracker;
use crate::controller::reconciler::errors::FailureReason;
use crate::controller::reconciler::status::merged_status;
use crate::controller::reconciler::timeout::check_start_timeout;
use crate::controller::reconciler::types::{
    PassOutcome, ReconcileResult, Reconciler, ReconcilerError,
};
use crate::crd::{condition_types, DevWorkspace, DevWorkspaceStatus, Phase};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

impl Reconciler {
    /// Run one reconcile pass for `namespace/name`
    ///
    /// # Errors
    ///
    /// Unclassified collaborator failures and cluster errors that could not
    /// be resolved by requeueing.
    pub async fn reconcile_workspace(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReconcileResult, ReconcilerError> {
        let config = self.config.read().await.clone();

        let Some(workspace) = self.store.get_workspace(namespace, name).await? else {
            debug!("DevWorkspace {}/{} no longer exists", namespace, name);
            return Ok(ReconcileResult::Done);
        };

        if workspace.metadata.deletion_timestamp.is_some() {
            let outcome = self.finalize(&workspace, &config).await;
            return self.flush(&workspace, outcome).await;
        }

        if workspace.workspace_id().is_empty() {
            let outcome = self.allocate_id(&workspace).await;
            return self.flush(&workspace, outcome).await;
        }

        let outcome = self.run_gates(&workspace, &config).await;
        self.finalize_pass(&workspace, &config, outcome).await
    }

    /// Gates 4 to 7
    async fn run_gates(&self, workspace: &DevWorkspace, config: &WorkspaceConfig) -> PassOutcome {
        let phase = workspace.status.as_ref().and_then(|s| s.phase);

        if phase == Some(Phase::Failing) && workspace.spec.started {
            return self.handle_failing(workspace, config).await;
        }

        if !workspace.spec.started {
            return self.stop_workspace(workspace, config).await;
        }

        if workspace
            .annotation(DEVWORKSPACE_STOP_REASON_ANNOTATION)
            .is_some()
        {
            return match self
                .store
                .remove_annotation(workspace, DEVWORKSPACE_STOP_REASON_ANNOTATION)
                .await
            {
                Ok(()) => PassOutcome::skip_flush(ReconcileResult::RequeueNow),
                Err(err) if err.is_conflict() || err.is_not_found() => {
                    PassOutcome::skip_flush(ReconcileResult::RequeueNow)
                }
                Err(err) => PassOutcome::abort(err),
            };
        }

        if !matches!(phase, Some(Phase::Starting | Phase::Running)) {
            info!("🚀 Starting DevWorkspace {}", workspace.key());
            let mut tracker = StatusTracker::new(Phase::Starting);
            tracker.set_condition_true(condition_types::STARTED, "DevWorkspace is starting");
            return PassOutcome::flush(tracker, ReconcileResult::RequeueNow);
        }

        self.run_pipeline(workspace, config).await
    }

    /// Post-processing shared by every exit of gates 4 to 7
    ///
    /// A workspace that stays in Starting is checked against the progress
    /// timeout; a timeout (or an unparsable timeout) fails the start, even
    /// when the pass itself ended in an unclassified error.
    pub(crate) async fn finalize_pass(
        &self,
        workspace: &DevWorkspace,
        config: &WorkspaceConfig,
        mut outcome: PassOutcome,
    ) -> Result<ReconcileResult, ReconcilerError> {
        let persisted = workspace.status.clone().unwrap_or_default();
        if let Some(tracker) = outcome.status.as_mut() {
            if persisted.phase == Some(Phase::Starting) && tracker.phase() == Phase::Starting {
                if let Err(err) = check_start_timeout(
                    &persisted,
                    tracker,
                    &config.progress_timeout,
                    self.clock.now(),
                ) {
                    warn!("DevWorkspace {}: {}", workspace.key(), err);
                    tracker.fail(err.to_string(), FailureReason::InfrastructureFailure);
                    if let Err(aborted) = &outcome.result {
                        debug!("Dropping error for timed-out {}: {}", workspace.key(), aborted);
                    }
                    outcome.result = Ok(ReconcileResult::RequeueNow);
                }
            }
        }
        self.flush(workspace, outcome).await
    }

    /// Write the pass's status, if any and if it changed
    ///
    /// Failed passes leave status untouched.
    async fn flush(
        &self,
        workspace: &DevWorkspace,
        outcome: PassOutcome,
    ) -> Result<ReconcileResult, ReconcilerError> {
        let (tracker, result) = match outcome {
            PassOutcome {
                status: Some(tracker),
                result: Ok(result),
            } => (tracker, result),
            PassOutcome { result, .. } => return result,
        };

        let persisted = workspace.status.clone().unwrap_or_default();
        let now = self.clock.now();
        let desired = merged_status(&persisted, &tracker, now);
        if desired == persisted {
            return Ok(result);
        }

        match self.store.replace_status(workspace, &desired).await {
            Ok(_) => {
                self.emit_transition_metrics(workspace, &persisted, &desired, now);
                Ok(result)
            }
            Err(err) if err.is_conflict() => {
                info!(
                    "Conflict updating status of {}; requeueing to read fresh state",
                    workspace.key()
                );
                Ok(ReconcileResult::RequeueNow)
            }
            Err(err) if err.is_not_found() => Ok(result),
            Err(err) => Err(err.into()),
        }
    }

    /// Lifecycle metrics for a status write that changed phase
    fn emit_transition_metrics(
        &self,
        workspace: &DevWorkspace,
        before: &DevWorkspaceStatus,
        after: &DevWorkspaceStatus,
        now: DateTime<Utc>,
    ) {
        if before.phase == after.phase {
            return;
        }
        let metrics = &self.provisioners.metrics;
        match after.phase {
            Some(Phase::Starting)
                if !matches!(before.phase, Some(Phase::Starting | Phase::Running)) =>
            {
                metrics.started(workspace);
            }
            Some(Phase::Running) => {
                let startup = after
                    .condition(condition_types::STARTED)
                    .and_then(|c| c.last_transition_time.as_deref())
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .and_then(|started| (now - started.with_timezone(&Utc)).to_std().ok());
                metrics.running(workspace, startup);
            }
            Some(Phase::Failing) => {
                let reason = FailureReason::from_condition_reason(
                    after
                        .condition(condition_types::FAILED_START)
                        .and_then(|c| c.reason.as_deref()),
                );
                metrics.failed(workspace, reason);
            }
            _ => {}
        }
    }
}
