//! # Cluster Access
//!
//! The [`WorkspaceStore`] trait is the engine's only path to the API server.
//! Production uses [`KubeWorkspaceStore`]; tests substitute an in-memory
//! implementation through the same seam.

mod kube_store;

pub use kube_store::KubeWorkspaceStore;

use crate::crd::{DevWorkspace, DevWorkspaceStatus};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::fmt;

/// Error returned by [`WorkspaceStore`] operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic concurrency check failed; the object changed underneath us
    #[error("conflict updating {0}")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("kubernetes API error: {0}")]
    Kube(#[source] kube::Error),
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Classify a kube error for the object identified by `what`
    pub fn from_kube(err: kube::Error, what: &str) -> Self {
        match &err {
            kube::Error::Api(response) if response.code == 409 => {
                StoreError::Conflict(what.to_string())
            }
            kube::Error::Api(response) if response.code == 404 => {
                StoreError::NotFound(what.to_string())
            }
            _ => StoreError::Kube(err),
        }
    }
}

/// Kind of a workspace-owned object that the stop path may delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Deployment,
    ConfigMap,
    Secret,
    Routing,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObjectKind::Deployment => "Deployment",
            ObjectKind::ConfigMap => "ConfigMap",
            ObjectKind::Secret => "Secret",
            ObjectKind::Routing => "DevWorkspaceRouting",
        })
    }
}

/// An object labelled with a workspace identifier
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedObject {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
    pub owner_references: Vec<OwnerReference>,
}

impl OwnedObject {
    /// True when the workspace is the object's only owner
    #[must_use]
    pub fn solely_owned_by(&self, uid: &str) -> bool {
        matches!(self.owner_references.as_slice(), [only] if only.uid == uid)
    }
}

/// Reads and writes against the API server used by the engine
///
/// Writes carry the resource version of the object they were computed from.
/// A stale version surfaces as [`StoreError::Conflict`].
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    /// Fetch a workspace; `None` when it no longer exists
    async fn get_workspace(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DevWorkspace>, StoreError>;

    async fn list_workspaces(&self, namespace: &str) -> Result<Vec<DevWorkspace>, StoreError>;

    /// Write the status sub-resource; returns the updated workspace
    async fn replace_status(
        &self,
        workspace: &DevWorkspace,
        status: &DevWorkspaceStatus,
    ) -> Result<DevWorkspace, StoreError>;

    async fn set_finalizers(
        &self,
        workspace: &DevWorkspace,
        finalizers: &[String],
    ) -> Result<(), StoreError>;

    async fn set_started(&self, workspace: &DevWorkspace, started: bool)
        -> Result<(), StoreError>;

    async fn remove_annotation(&self, workspace: &DevWorkspace, key: &str)
        -> Result<(), StoreError>;

    async fn namespace_terminating(&self, namespace: &str) -> Result<bool, StoreError>;

    /// Objects labelled with the workspace identifier
    async fn list_owned_objects(
        &self,
        namespace: &str,
        workspace_id: &str,
    ) -> Result<Vec<OwnedObject>, StoreError>;

    /// Delete an object; a missing object counts as deleted
    async fn delete_object(&self, object: &OwnedObject) -> Result<(), StoreError>;

    /// Create or update a ConfigMap
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "workspace.devfile.io/v1alpha2".to_string(),
            kind: "DevWorkspace".to_string(),
            name: "ws".to_string(),
            uid: uid.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_solely_owned_by() {
        let object = |owners: Vec<OwnerReference>| OwnedObject {
            kind: ObjectKind::Secret,
            namespace: "user".to_string(),
            name: "s".to_string(),
            owner_references: owners,
        };

        assert!(object(vec![owner("abc")]).solely_owned_by("abc"));
        assert!(!object(vec![owner("other")]).solely_owned_by("abc"));
        assert!(!object(vec![]).solely_owned_by("abc"));
        assert!(!object(vec![owner("abc"), owner("other")]).solely_owned_by("abc"));
    }
}
