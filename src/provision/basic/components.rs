//! # Kubernetes Components
//!
//! Inlined manifests of `kubernetes`/`openshift` components are applied into
//! the workspace namespace with the workspace as owner. Manifests referenced
//! by URI are not fetched.

use crate::constants::FIELD_MANAGER;
use crate::controller::reconciler::{FailureReason, ProvisionError};
use crate::crd::{Component, DevWorkspace, DevWorkspaceTemplateSpec, KubeManifestComponent};
use crate::provision::basic::{namespace_of, owned_by, workspace_labels};
use crate::provision::SubResourceSynchronizer;
use anyhow::Context;
use async_trait::async_trait;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::{discovery, Client};
use tracing::debug;

fn bad_request(component: &str, message: &str) -> ProvisionError {
    ProvisionError::fail_with_reason(
        format!("component '{component}': {message}"),
        FailureReason::BadRequest,
    )
}

fn manifest(component: &Component) -> Option<&KubeManifestComponent> {
    component
        .kubernetes
        .as_ref()
        .or(component.openshift.as_ref())
}

/// Parse an inlined manifest into an object and its group/version/kind
fn parse_manifest(
    component: &str,
    inlined: &str,
) -> Result<(DynamicObject, GroupVersionKind), ProvisionError> {
    let object: DynamicObject = serde_yaml::from_str(inlined)
        .map_err(|err| bad_request(component, &format!("invalid inlined manifest: {err}")))?;
    let Some(types) = object.types.as_ref() else {
        return Err(bad_request(component, "manifest has no apiVersion or kind"));
    };
    let (group, version) = types
        .api_version
        .split_once('/')
        .unwrap_or(("", types.api_version.as_str()));
    if version.is_empty() || types.kind.is_empty() {
        return Err(bad_request(component, "manifest has no apiVersion or kind"));
    }
    if object.metadata.name.as_deref().is_none_or(str::is_empty) {
        return Err(bad_request(component, "manifest has no metadata.name"));
    }
    let gvk = GroupVersionKind::gvk(group, version, &types.kind);
    Ok((object, gvk))
}

/// Applies inlined component manifests
#[derive(Clone)]
pub struct KubeSubResources {
    client: Client,
}

impl std::fmt::Debug for KubeSubResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSubResources").finish_non_exhaustive()
    }
}

impl KubeSubResources {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SubResourceSynchronizer for KubeSubResources {
    async fn sync(
        &self,
        workspace: &DevWorkspace,
        template: &DevWorkspaceTemplateSpec,
    ) -> Result<(), ProvisionError> {
        let namespace = namespace_of(workspace)?;
        for component in &template.components {
            let Some(spec) = manifest(component) else {
                continue;
            };
            if spec.deploy_by_default == Some(false) {
                continue;
            }
            if spec.uri.is_some() {
                return Err(bad_request(
                    &component.name,
                    "manifests referenced by uri are not supported",
                ));
            }
            let Some(inlined) = spec.inlined.as_deref() else {
                return Err(bad_request(&component.name, "no inlined manifest"));
            };

            let (mut object, gvk) = parse_manifest(&component.name, inlined)?;
            let (resource, _capabilities) = discovery::pinned_kind(&self.client, &gvk)
                .await
                .with_context(|| format!("failed to discover {}/{}", gvk.group, gvk.kind))?;

            let name = object.metadata.name.clone().unwrap_or_default();
            object.metadata.namespace = Some(namespace.clone());
            object.metadata.owner_references = owned_by(workspace);
            object
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .extend(workspace_labels(workspace));

            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), &namespace, &resource);
            api.patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&object),
            )
            .await
            .with_context(|| format!("failed to apply {} {name}", gvk.kind))?;
            debug!("Applied {} {}/{} for component {}", gvk.kind, namespace, name, component.name);
        }
        Ok(())
    }
}
