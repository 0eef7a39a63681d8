//! # Kubernetes-backed Collaborators
//!
//! The collaborator implementations wired into the controller binary. Each
//! one owns a `kube::Client` and writes the objects it is responsible for
//! with server-side apply under the controller's field manager.
//!
//! ## Module Structure
//!
//! - `resolver.rs` - Template resolution for self-contained devfiles
//! - `storage.rs` - Ephemeral, shared-claim and per-workspace storage
//! - `access.rs` - Namespace Role and RoleBinding for workspace service accounts
//! - `routing.rs` - In-cluster Service routing
//! - `identity.rs` - Workspace service accounts and image pull secrets
//! - `automount.rs` - Secrets and ConfigMaps labelled for automatic mounting
//! - `components.rs` - Inlined kubernetes/openshift component manifests
//! - `workload.rs` - The workspace Deployment

mod access;
mod automount;
mod components;
mod identity;
mod resolver;
mod routing;
mod storage;
mod workload;

pub use access::KubeAccessController;
pub use automount::KubeAutomount;
pub use components::KubeSubResources;
pub use identity::{KubeIdentity, KubePullSecrets};
pub use resolver::PassthroughResolver;
pub use routing::BasicRouting;
pub use storage::{ClaimStorage, EphemeralStorage, PerWorkspaceStorage};
pub use workload::KubeDeploymentWorkload;

use crate::constants::{
    COMMON_STORAGE_TYPE, DEVWORKSPACE_ID_LABEL, DEVWORKSPACE_NAME_LABEL,
    EPHEMERAL_STORAGE_TYPE, FIELD_MANAGER, PER_USER_STORAGE_TYPE, PER_WORKSPACE_STORAGE_TYPE,
};
use crate::controller::reconciler::ProvisionError;
use crate::crd::DevWorkspace;
use crate::provision::{StorageProvisioner, StorageRegistry};
use anyhow::Context;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Storage registry with every built-in strategy
///
/// `per-user` and `common` share one implementation; `common` is the older
/// name of the same strategy.
#[must_use]
pub fn default_storage_registry(client: &Client) -> StorageRegistry {
    let shared_claim: Arc<dyn StorageProvisioner> = Arc::new(ClaimStorage::new(client.clone()));
    StorageRegistry::new()
        .with(PER_USER_STORAGE_TYPE, Arc::clone(&shared_claim))
        .with(COMMON_STORAGE_TYPE, shared_claim)
        .with(
            PER_WORKSPACE_STORAGE_TYPE,
            Arc::new(PerWorkspaceStorage::new(client.clone())),
        )
        .with(EPHEMERAL_STORAGE_TYPE, Arc::new(EphemeralStorage))
}

/// Namespace of a workspace
pub(crate) fn namespace_of(workspace: &DevWorkspace) -> Result<String, ProvisionError> {
    workspace.namespace().ok_or_else(|| {
        ProvisionError::Other(anyhow::anyhow!(
            "DevWorkspace {} has no namespace",
            workspace.name_any()
        ))
    })
}

/// Labels identifying objects that belong to a workspace
pub(crate) fn workspace_labels(workspace: &DevWorkspace) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            DEVWORKSPACE_ID_LABEL.to_string(),
            workspace.workspace_id().to_string(),
        ),
        (DEVWORKSPACE_NAME_LABEL.to_string(), workspace.name_any()),
    ])
}

/// Controller owner reference pointing at the workspace
pub(crate) fn owned_by(workspace: &DevWorkspace) -> Option<Vec<OwnerReference>> {
    workspace.controller_owner_ref(&()).map(|owner| vec![owner])
}

/// Name of the service account created for a workspace
#[must_use]
pub fn service_account_name(workspace: &DevWorkspace) -> String {
    format!("{}-sa", workspace.workspace_id())
}

/// Server-side apply `object` under the controller's field manager
pub(crate) async fn apply<K>(api: &Api<K>, name: &str, object: &K) -> Result<K, ProvisionError>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let applied = api
        .patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(object),
        )
        .await
        .with_context(|| format!("failed to apply {} {name}", K::kind(&())))?;
    Ok(applied)
}

/// True for API errors with the given status code
pub(crate) fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DevWorkspaceSpec, DevWorkspaceStatus};

    /// Client for an API server that is never contacted
    fn offline_client() -> Client {
        let config = kube::Config::new("http://127.0.0.1:6443".parse().unwrap());
        Client::try_from(config).unwrap()
    }

    #[tokio::test]
    async fn test_default_storage_registry_covers_every_type() {
        let registry = default_storage_registry(&offline_client());
        let template = crate::crd::DevWorkspaceTemplateSpec::default();

        for storage_type in [
            PER_USER_STORAGE_TYPE,
            COMMON_STORAGE_TYPE,
            PER_WORKSPACE_STORAGE_TYPE,
            EPHEMERAL_STORAGE_TYPE,
        ] {
            assert!(
                registry.for_template(&template, storage_type).is_ok(),
                "{storage_type} should be registered"
            );
        }
        assert!(registry.for_template(&template, "async").is_err());
    }

    #[tokio::test]
    async fn test_shared_claim_types_share_one_provisioner() {
        let registry = default_storage_registry(&offline_client());
        let template = crate::crd::DevWorkspaceTemplateSpec::default();

        let per_user = registry.for_template(&template, PER_USER_STORAGE_TYPE).unwrap();
        let common = registry.for_template(&template, COMMON_STORAGE_TYPE).unwrap();
        assert!(Arc::ptr_eq(&per_user, &common));
    }

    #[test]
    fn test_workspace_labels_and_service_account_name() {
        let mut ws = DevWorkspace::new("my-ws", DevWorkspaceSpec::default());
        ws.status = Some(DevWorkspaceStatus {
            devworkspace_id: "workspace1a2b3c".to_string(),
            ..Default::default()
        });

        let labels = workspace_labels(&ws);
        assert_eq!(labels[DEVWORKSPACE_ID_LABEL], "workspace1a2b3c");
        assert_eq!(labels[DEVWORKSPACE_NAME_LABEL], "my-ws");
        assert_eq!(service_account_name(&ws), "workspace1a2b3c-sa");
    }
}
