//! # Kube-backed Workspace Store
//!
//! Status, finalizer and annotation writes are JSON merge patches that
//! carry `metadata.resourceVersion`, which makes the API server reject
//! them with 409 when the object changed since it was read.

use crate::cluster::{ObjectKind, OwnedObject, StoreError, WorkspaceStore};
use crate::constants::{DEVWORKSPACE_ID_LABEL, FIELD_MANAGER};
use crate::crd::{DevWorkspace, DevWorkspaceStatus};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
    PatchParams,
};
use kube::{Client, Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::debug;

/// [`WorkspaceStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeWorkspaceStore {
    client: Client,
}

impl std::fmt::Debug for KubeWorkspaceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeWorkspaceStore").finish_non_exhaustive()
    }
}

fn routing_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: "controller.devfile.io".to_string(),
        version: "v1alpha1".to_string(),
        kind: "DevWorkspaceRouting".to_string(),
    })
}

fn owned<K: Resource>(kind: ObjectKind, namespace: &str, objects: Vec<K>) -> Vec<OwnedObject> {
    objects
        .into_iter()
        .map(|object| {
            let meta = object.meta();
            OwnedObject {
                kind,
                namespace: namespace.to_string(),
                name: meta.name.clone().unwrap_or_default(),
                owner_references: meta.owner_references.clone().unwrap_or_default(),
            }
        })
        .collect()
}

impl KubeWorkspaceStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn workspaces(&self, workspace: &DevWorkspace) -> Api<DevWorkspace> {
        Api::namespaced(
            self.client.clone(),
            workspace.namespace().as_deref().unwrap_or("default"),
        )
    }

    async fn merge_patch(
        &self,
        workspace: &DevWorkspace,
        patch: Value,
    ) -> Result<DevWorkspace, StoreError> {
        let name = workspace.name_any();
        self.workspaces(workspace)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &workspace.key()))
    }

    async fn list_labelled<K>(&self, namespace: &str, selector: &ListParams) -> Result<Vec<K>, StoreError>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.list(selector)
            .await
            .map(|list| list.items)
            .map_err(|e| StoreError::from_kube(e, namespace))
    }
}

#[async_trait]
impl WorkspaceStore for KubeWorkspaceStore {
    async fn get_workspace(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DevWorkspace>, StoreError> {
        let api: Api<DevWorkspace> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("{namespace}/{name}")))
    }

    async fn list_workspaces(&self, namespace: &str) -> Result<Vec<DevWorkspace>, StoreError> {
        self.list_labelled(namespace, &ListParams::default()).await
    }

    async fn replace_status(
        &self,
        workspace: &DevWorkspace,
        status: &DevWorkspaceStatus,
    ) -> Result<DevWorkspace, StoreError> {
        let mut status_value = serde_json::to_value(status)?;
        // Merge patches only clear fields that are explicitly null
        if let Some(fields) = status_value.as_object_mut() {
            for key in ["devworkspaceId", "mainUrl", "message", "phase"] {
                fields.entry(key).or_insert(Value::Null);
            }
        }
        let patch = json!({
            "metadata": { "resourceVersion": workspace.resource_version() },
            "status": status_value,
        });

        let name = workspace.name_any();
        self.workspaces(workspace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &workspace.key()))
    }

    async fn set_finalizers(
        &self,
        workspace: &DevWorkspace,
        finalizers: &[String],
    ) -> Result<(), StoreError> {
        let patch = json!({
            "metadata": {
                "resourceVersion": workspace.resource_version(),
                "finalizers": finalizers,
            }
        });
        self.merge_patch(workspace, patch).await.map(|_| ())
    }

    async fn set_started(
        &self,
        workspace: &DevWorkspace,
        started: bool,
    ) -> Result<(), StoreError> {
        let patch = json!({
            "metadata": { "resourceVersion": workspace.resource_version() },
            "spec": { "started": started },
        });
        self.merge_patch(workspace, patch).await.map(|_| ())
    }

    async fn remove_annotation(
        &self,
        workspace: &DevWorkspace,
        key: &str,
    ) -> Result<(), StoreError> {
        let patch = json!({
            "metadata": {
                "resourceVersion": workspace.resource_version(),
                "annotations": { key: Value::Null },
            }
        });
        self.merge_patch(workspace, patch).await.map(|_| ())
    }

    async fn namespace_terminating(&self, namespace: &str) -> Result<bool, StoreError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let found = api
            .get_opt(namespace)
            .await
            .map_err(|e| StoreError::from_kube(e, namespace))?;
        Ok(found.is_some_and(|ns| {
            ns.metadata.deletion_timestamp.is_some()
                || ns
                    .status
                    .and_then(|s| s.phase)
                    .is_some_and(|phase| phase == "Terminating")
        }))
    }

    async fn list_owned_objects(
        &self,
        namespace: &str,
        workspace_id: &str,
    ) -> Result<Vec<OwnedObject>, StoreError> {
        let selector = ListParams::default().labels(&format!("{DEVWORKSPACE_ID_LABEL}={workspace_id}"));

        let mut objects = owned(
            ObjectKind::Deployment,
            namespace,
            self.list_labelled::<Deployment>(namespace, &selector).await?,
        );
        objects.extend(owned(
            ObjectKind::ConfigMap,
            namespace,
            self.list_labelled::<ConfigMap>(namespace, &selector).await?,
        ));
        objects.extend(owned(
            ObjectKind::Secret,
            namespace,
            self.list_labelled::<Secret>(namespace, &selector).await?,
        ));

        let routing: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &routing_resource());
        match routing.list(&selector).await {
            Ok(list) => objects.extend(owned(ObjectKind::Routing, namespace, list.items)),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!("DevWorkspaceRouting API not installed, skipping routing cleanup");
            }
            Err(e) => return Err(StoreError::from_kube(e, namespace)),
        }

        Ok(objects)
    }

    async fn delete_object(&self, object: &OwnedObject) -> Result<(), StoreError> {
        let params = DeleteParams::background();
        let result = match object.kind {
            ObjectKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &object.namespace);
                api.delete(&object.name, &params).await.map(|_| ())
            }
            ObjectKind::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &object.namespace);
                api.delete(&object.name, &params).await.map(|_| ())
            }
            ObjectKind::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), &object.namespace);
                api.delete(&object.name, &params).await.map(|_| ())
            }
            ObjectKind::Routing => {
                let api: Api<DynamicObject> = Api::namespaced_with(
                    self.client.clone(),
                    &object.namespace,
                    &routing_resource(),
                );
                api.delete(&object.name, &params).await.map(|_| ())
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(StoreError::from_kube(
                e,
                &format!("{} {}/{}", object.kind, object.namespace, object.name),
            )),
        }
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), StoreError> {
        let namespace = config_map.metadata.namespace.as_deref().unwrap_or("default");
        let name = config_map.name_any();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(config_map),
        )
        .await
        .map(|_| ())
        .map_err(|e| StoreError::from_kube(e, &format!("ConfigMap {namespace}/{name}")))
    }
}
