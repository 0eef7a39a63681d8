//! # Provisioning Pipeline
//!
//! The ordered sequence of steps that takes a started workspace from a
//! devfile to a running, healthy workload. Every step is idempotent; a pass
//! runs the pipeline from the top and stops at the first step that is not
//! ready yet.
//!
//! Each step records a condition. Step failures go through
//! [`classify`](crate::controller::reconciler::classify):
//!
//! - `Retry`: the step's condition goes False and the pass requeues after the
//!   collaborator's delay
//! - `Fail`: the workspace moves to Failing with a FailedStart condition
//! - `Warning`: recorded, and the pipeline continues
//! - anything else aborts the pass and is handed to the error policy

use crate::config::WorkspaceConfig;
use crate::constants::{
    DEVWORKSPACE_RESTRICTED_ACCESS_ANNOTATION, DEVWORKSPACE_STORAGE_TYPE_ATTRIBUTE,
    EPHEMERAL_STORAGE_TYPE, HEALTH_CHECK_REQUEUE, RBAC_CLEANUP_FINALIZER,
    STORAGE_CLEANUP_FINALIZER,
};
use crate::controller::reconciler::conditions::StatusTracker;
use crate::controller::reconciler::errors::{classify, FailureReason, ProvisionError, StepOutcome};
use crate::controller::reconciler::types::{
    PassOutcome, ReconcileResult, Reconciler, ReconcilerError,
};
use crate::crd::{condition_types, DevWorkspace, Phase};
use crate::provision::containers::{annotate_endpoint_urls, main_url, materialize};
use crate::provision::env::{common_env, inject_env};
use crate::provision::home::{add_persistent_home, needs_persistent_home};
use crate::provision::metadata::{metadata_config_map, mount_metadata};
use crate::provision::projects::{project_clone_container, validate_projects};
use crate::provision::tokens::token_additions;
use std::ops::ControlFlow;
use tracing::{debug, info};

/// A pipeline step as seen by the classifier
#[derive(Debug, Clone, Copy)]
struct Step {
    /// Prefix of Fail messages
    context: &'static str,
    /// Condition set False on Retry, if the step has one
    condition: Option<&'static str>,
    /// Reason used when the collaborator does not pick one
    reason: FailureReason,
}

const RESOLVE: Step = Step {
    context: "Error processing devfile",
    condition: Some(condition_types::DEVWORKSPACE_RESOLVED),
    reason: FailureReason::BadRequest,
};

const STORAGE: Step = Step {
    context: "Error provisioning storage",
    condition: Some(condition_types::STORAGE_READY),
    reason: FailureReason::InfrastructureFailure,
};

const POD_ADDITIONS: Step = Step {
    context: "Error creating pod additions from devfile",
    condition: None,
    reason: FailureReason::BadRequest,
};

const AUTOMOUNT: Step = Step {
    context: "Failed to process automount resources",
    condition: None,
    reason: FailureReason::BadRequest,
};

const RBAC: Step = Step {
    context: "Error provisioning rbac",
    condition: Some(condition_types::SERVICE_ACCOUNT_READY),
    reason: FailureReason::InfrastructureFailure,
};

const ROUTING: Step = Step {
    context: "Error creating DevWorkspace routing",
    condition: Some(condition_types::ROUTING_READY),
    reason: FailureReason::InfrastructureFailure,
};

const METADATA: Step = Step {
    context: "Error provisioning metadata configmap",
    condition: None,
    reason: FailureReason::InfrastructureFailure,
};

const SERVICE_ACCOUNT: Step = Step {
    context: "Error creating DevWorkspace service account",
    condition: Some(condition_types::SERVICE_ACCOUNT_READY),
    reason: FailureReason::InfrastructureFailure,
};

const PULL_SECRETS: Step = Step {
    context: "Error provisioning pull secrets",
    condition: Some(condition_types::PULL_SECRETS_READY),
    reason: FailureReason::InfrastructureFailure,
};

const KUBE_COMPONENTS: Step = Step {
    context: "Error provisioning kubernetes components",
    condition: Some(condition_types::KUBE_COMPONENTS_READY),
    reason: FailureReason::BadRequest,
};

const DEPLOYMENT: Step = Step {
    context: "Error creating DevWorkspace deployment",
    condition: Some(condition_types::DEPLOYMENT_READY),
    reason: FailureReason::InfrastructureFailure,
};

const HEALTH: Step = Step {
    context: "Error checking DevWorkspace health",
    condition: Some(condition_types::READY),
    reason: FailureReason::InfrastructureFailure,
};

/// Apply the classifier's decision for a failed step to `tracker`
///
/// `Continue` only for warnings from optional steps. A required step has no
/// value to carry on with, so its warning fails the start with the
/// warning's own text.
fn on_step_error(
    tracker: &mut StatusTracker,
    err: ProvisionError,
    step: Step,
    required: bool,
) -> ControlFlow<Result<ReconcileResult, ReconcilerError>> {
    match classify(err, step.context, step.reason) {
        StepOutcome::Retry { message, delay } => {
            debug!("{}: {} (retrying in {:?})", step.context, message, delay);
            if let Some(condition) = step.condition {
                tracker.set_condition_false(condition, message);
            }
            ControlFlow::Break(Ok(ReconcileResult::RequeueAfter(delay)))
        }
        StepOutcome::Fail { message, reason } => {
            tracker.fail(message, reason);
            ControlFlow::Break(Ok(ReconcileResult::RequeueNow))
        }
        StepOutcome::Warning { message } if required => {
            tracker.fail(format!("{}: {}", step.context, message), step.reason);
            ControlFlow::Break(Ok(ReconcileResult::RequeueNow))
        }
        StepOutcome::Warning { message } => {
            tracker.add_warning(message, None);
            ControlFlow::Continue(())
        }
        StepOutcome::Unclassified(err) => ControlFlow::Break(Err(err.into())),
    }
}

/// Run a step; ends the pass on anything but success or a warning
///
/// Evaluates to `Some(value)` on success and `None` after a warning.
macro_rules! step {
    ($tracker:ident, $step:expr, $call:expr) => {
        match $call {
            Ok(value) => Some(value),
            Err(err) => match on_step_error(&mut $tracker, err, $step, false) {
                ControlFlow::Break(result) => {
                    return PassOutcome {
                        status: Some($tracker),
                        result,
                    }
                }
                ControlFlow::Continue(()) => None,
            },
        }
    };
}

/// Like `step!`, for steps whose value the pipeline cannot do without
macro_rules! required_step {
    ($tracker:ident, $step:expr, $call:expr) => {
        match $call {
            Ok(value) => value,
            Err(err) => {
                let result = match on_step_error(&mut $tracker, err, $step, true) {
                    ControlFlow::Break(result) => result,
                    ControlFlow::Continue(()) => Ok(ReconcileResult::RequeueNow),
                };
                return PassOutcome {
                    status: Some($tracker),
                    result,
                };
            }
        }
    };
}

impl Reconciler {
    /// Provision a started workspace; see the module docs for the step order
    #[allow(clippy::too_many_lines, reason = "the pipeline reads top to bottom")]
    pub(crate) async fn run_pipeline(
        &self,
        workspace: &DevWorkspace,
        config: &WorkspaceConfig,
    ) -> PassOutcome {
        let key = workspace.key();
        let workspace_id = workspace.workspace_id().to_string();
        let providers = &self.provisioners;
        let mut tracker = StatusTracker::new(Phase::Starting);
        tracker.set_condition_true(condition_types::STARTED, "DevWorkspace is starting");

        if workspace.annotation(DEVWORKSPACE_RESTRICTED_ACCESS_ANNOTATION) == Some("true")
            && !config.webhooks_enabled
        {
            tracker.fail(
                "Workspace has restricted-access annotation set but webhooks are not enabled",
                FailureReason::BadRequest,
            );
            return PassOutcome::flush(tracker, ReconcileResult::RequeueNow);
        }

        // Devfile
        let resolved = required_step!(tracker, RESOLVE, providers.resolver.resolve(workspace).await);
        for warning in resolved.warnings {
            tracker.add_warning(warning, None);
        }
        let mut template = resolved.template;
        step!(tracker, RESOLVE, providers.resolver.validate_components(&template));
        tracker.set_condition_true(condition_types::DEVWORKSPACE_RESOLVED, "Resolved DevWorkspace");

        // Storage strategy, persistent home, storage finalizer
        let storage = required_step!(
            tracker,
            STORAGE,
            providers
                .storage
                .for_template(&template, &config.default_storage_class_type)
        );
        let ephemeral = template
            .attribute(DEVWORKSPACE_STORAGE_TYPE_ATTRIBUTE)
            .unwrap_or(config.default_storage_class_type.as_str())
            == EPHEMERAL_STORAGE_TYPE;
        if config.persist_user_home && !ephemeral && needs_persistent_home(&template)
        {
            if let Err(message) = add_persistent_home(&mut template) {
                tracker.add_warning(message, None);
            }
        }
        if storage.needs_storage(&template) && !workspace.has_finalizer(STORAGE_CLEANUP_FINALIZER)
        {
            return self
                .add_finalizer(workspace, tracker, STORAGE_CLEANUP_FINALIZER)
                .await;
        }

        // Pod additions from the devfile
        let mut pod = required_step!(tracker, POD_ADDITIONS, materialize(&template));
        inject_env(&mut pod, &common_env(workspace, &template));

        let project_problems = validate_projects(&template);
        if !project_problems.is_empty() {
            tracker.fail(
                format!("Invalid devfile projects: {}", project_problems.join("; ")),
                FailureReason::BadRequest,
            );
            return PassOutcome::flush(tracker, ReconcileResult::RequeueNow);
        }
        if let Some(clone) = project_clone_container(&template, &config.project_clone_image) {
            pod.init_containers.push(clone);
        }

        let tokens = token_additions(&template, &mut pod);
        if tokens > 0 {
            debug!("Mounted {} service account token volume(s) for {}", tokens, key);
        }
        step!(tracker, AUTOMOUNT, providers.automount.provision(workspace, &mut pod).await);
        step!(
            tracker,
            STORAGE,
            storage.provision_storage(&mut pod, workspace, &template).await
        );
        tracker.set_condition_true(condition_types::STORAGE_READY, "Storage ready");

        // Access control
        if !workspace.has_finalizer(RBAC_CLEANUP_FINALIZER) {
            return self
                .add_finalizer(workspace, tracker, RBAC_CLEANUP_FINALIZER)
                .await;
        }
        step!(tracker, RBAC, providers.access.sync(workspace).await);

        // Routing
        let routing = required_step!(tracker, ROUTING, providers.routing.sync(workspace, &template).await);
        tracker.set_condition_true(
            condition_types::ROUTING_READY,
            routing.message.as_deref().unwrap_or("Networking ready"),
        );
        if let Some(additions) = routing.pod_additions {
            pod.merge(additions);
        }
        let url = main_url(&routing.exposed_endpoints);
        tracker.set_main_url(url.clone());
        let mut flattened = template.clone();
        annotate_endpoint_urls(&mut flattened, &routing.exposed_endpoints);

        // Metadata artifact
        let config_map = required_step!(
            tracker,
            METADATA,
            metadata_config_map(workspace, &flattened)
                .map_err(|err| ProvisionError::fail(format!("failed to encode devfile: {err}")))
        );
        step!(
            tracker,
            METADATA,
            self.store
                .apply_config_map(&config_map)
                .await
                .map_err(ProvisionError::from)
        );
        mount_metadata(&mut pod, &workspace_id);

        // Identity
        let service_account = if config.service_account_creation_disabled {
            if config.service_account_name.is_empty() {
                tracker.fail(
                    "Service account creation is disabled but no service account name is configured",
                    FailureReason::InfrastructureFailure,
                );
                return PassOutcome::flush(tracker, ReconcileResult::RequeueNow);
            }
            config.service_account_name.clone()
        } else {
            required_step!(
                tracker,
                SERVICE_ACCOUNT,
                providers
                    .identity
                    .sync_service_account(workspace, &pod.service_account_annotations)
                    .await
            )
        };
        tracker.set_condition_true(
            condition_types::SERVICE_ACCOUNT_READY,
            "DevWorkspace serviceaccount ready",
        );

        let pull_secrets = required_step!(
            tracker,
            PULL_SECRETS,
            providers.pull_secrets.sync(workspace, &service_account).await
        );
        pod.merge(pull_secrets);
        tracker.set_condition_true(condition_types::PULL_SECRETS_READY, "DevWorkspace secrets ready");

        if template.has_kube_components() {
            step!(
                tracker,
                KUBE_COMPONENTS,
                providers.sub_resources.sync(workspace, &template).await
            );
            tracker.set_condition_true(
                condition_types::KUBE_COMPONENTS_READY,
                "Kubernetes components ready",
            );
        }

        // Workload
        step!(
            tracker,
            DEPLOYMENT,
            providers
                .workload
                .sync(workspace, &pod, &service_account)
                .await
        );
        tracker.set_condition_true(condition_types::DEPLOYMENT_READY, "DevWorkspace deployment ready");

        if !url.is_empty() {
            let probe = required_step!(tracker, HEALTH, providers.health.check(&url).await);
            if !probe.ready {
                debug!(
                    "Main endpoint of {} not ready yet (status {:?})",
                    key, probe.status_code
                );
                tracker.set_condition_false(condition_types::READY, "Waiting for editor to start");
                return PassOutcome::flush(
                    tracker,
                    ReconcileResult::RequeueAfter(HEALTH_CHECK_REQUEUE),
                );
            }
        }

        tracker.set_condition_true(condition_types::READY, "");
        tracker.set_phase(Phase::Running);
        if workspace.status.as_ref().and_then(|s| s.phase) != Some(Phase::Running) {
            info!("✅ DevWorkspace {} is running", key);
        }
        PassOutcome::flush(tracker, ReconcileResult::Done)
    }

    /// Append `finalizer` to the workspace and requeue
    async fn add_finalizer(
        &self,
        workspace: &DevWorkspace,
        tracker: StatusTracker,
        finalizer: &str,
    ) -> PassOutcome {
        let mut finalizers = workspace.finalizers().to_vec();
        finalizers.push(finalizer.to_string());
        match self.store.set_finalizers(workspace, &finalizers).await {
            Ok(()) => {
                debug!("Added finalizer {} to {}", finalizer, workspace.key());
                PassOutcome::flush(tracker, ReconcileResult::RequeueNow)
            }
            Err(err) if err.is_conflict() => {
                info!("Conflict adding finalizer to {}; retrying", workspace.key());
                PassOutcome::flush(tracker, ReconcileResult::RequeueNow)
            }
            Err(err) => PassOutcome::error(tracker, err),
        }
    }
}
