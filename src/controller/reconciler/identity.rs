//! # Identifier Allocation
//!
//! Every workspace gets an identifier once, before anything is provisioned.
//! It names the workload and labels every owned object, so it never changes
//! after it is written to status.
//!
//! The identifier is either the `controller.devfile.io/devworkspace_id_override`
//! annotation, validated for length and uniqueness within the namespace, or
//! `workspace` followed by the first three groups of the resource UID.

use crate::constants::{
    DEVWORKSPACE_ID_OVERRIDE_ANNOTATION, WORKSPACE_ID_OVERRIDE_MAX_LEN, WORKSPACE_ID_PREFIX,
};
use crate::controller::reconciler::conditions::StatusTracker;
use crate::controller::reconciler::errors::FailureReason;
use crate::controller::reconciler::types::{PassOutcome, ReconcileResult, Reconciler};
use crate::crd::{condition_types, DevWorkspace, DevWorkspaceStatus, Phase};
use tracing::{info, warn};
use uuid::Uuid;

/// Identifier derived from a resource UID
///
/// Non-UUID input falls back to joining its first three `-`-separated groups.
#[must_use]
pub fn derive_workspace_id(uid: &str) -> String {
    let groups = match Uuid::parse_str(uid) {
        Ok(parsed) => parsed.simple().to_string().chars().take(16).collect(),
        Err(_) => uid.split('-').take(3).collect::<String>(),
    };
    format!("{WORKSPACE_ID_PREFIX}{groups}")
}

impl Reconciler {
    /// Pick and persist an identifier for `workspace`
    pub(crate) async fn allocate_id(&self, workspace: &DevWorkspace) -> PassOutcome {
        let key = workspace.key();
        let workspace_id = match workspace.annotation(DEVWORKSPACE_ID_OVERRIDE_ANNOTATION) {
            Some(requested) => match self.check_id_override(workspace, requested).await {
                Ok(Some(message)) => return fail_id(workspace, message),
                Ok(None) => requested.to_string(),
                Err(err) => return PassOutcome::abort(err),
            },
            None => derive_workspace_id(workspace.uid()),
        };

        let status = DevWorkspaceStatus {
            devworkspace_id: workspace_id.clone(),
            ..workspace.status.clone().unwrap_or_default()
        };
        match self.store.replace_status(workspace, &status).await {
            Ok(_) => {
                info!("🆔 Assigned identifier {} to DevWorkspace {}", workspace_id, key);
                PassOutcome::skip_flush(ReconcileResult::RequeueNow)
            }
            Err(err) if err.is_conflict() => {
                info!("Conflict assigning identifier to {}; retrying", key);
                PassOutcome::skip_flush(ReconcileResult::RequeueNow)
            }
            Err(err) if err.is_not_found() => PassOutcome::skip_flush(ReconcileResult::Done),
            Err(err) => PassOutcome::abort(err),
        }
    }

    /// `Ok(Some(message))` when the requested identifier is unusable
    async fn check_id_override(
        &self,
        workspace: &DevWorkspace,
        requested: &str,
    ) -> Result<Option<String>, crate::cluster::StoreError> {
        if requested.len() > WORKSPACE_ID_OVERRIDE_MAX_LEN {
            return Ok(Some(format!(
                "Failed to set DevWorkspace ID: value '{requested}' is longer than {WORKSPACE_ID_OVERRIDE_MAX_LEN} characters"
            )));
        }
        let namespace = workspace.metadata.namespace.as_deref().unwrap_or_default();
        let taken = self
            .store
            .list_workspaces(namespace)
            .await?
            .iter()
            .any(|other| other.uid() != workspace.uid() && other.workspace_id() == requested);
        if taken {
            return Ok(Some(format!(
                "Failed to set DevWorkspace ID: DevWorkspace ID {requested} is already in use"
            )));
        }
        Ok(None)
    }
}

fn fail_id(workspace: &DevWorkspace, message: String) -> PassOutcome {
    warn!("DevWorkspace {}: {}", workspace.key(), message);
    let mut tracker = StatusTracker::new(Phase::Failed);
    tracker.set_condition_true_with_reason(
        condition_types::FAILED_START,
        message,
        FailureReason::BadRequest.as_str(),
    );
    PassOutcome::flush(tracker, ReconcileResult::Done)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_workspace_id() {
        let test_cases = vec![
            (
                "8c1a5b0e-53c4-4f3b-9d5e-1a2b3c4d5e6f",
                "workspace8c1a5b0e53c44f3b",
                "canonical uuid",
            ),
            (
                "8C1A5B0E-53C4-4F3B-9D5E-1A2B3C4D5E6F",
                "workspace8c1a5b0e53c44f3b",
                "uppercase uuid",
            ),
            ("abc-def-ghi-jkl", "workspaceabcdefghi", "non-uuid uid"),
            ("", "workspace", "missing uid"),
        ];
        for (uid, expected, description) in test_cases {
            assert_eq!(derive_workspace_id(uid), expected, "{description}");
        }
    }

    #[test]
    fn test_derived_id_is_deterministic() {
        let uid = "0f8fad5b-d9cb-469f-a165-70867728950e";
        assert_eq!(derive_workspace_id(uid), derive_workspace_id(uid));
        assert_eq!(derive_workspace_id(uid).len(), "workspace".len() + 16);
    }
}
