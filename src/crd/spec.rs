//! # DevWorkspace Spec
//!
//! Main CRD specification types.

use crate::crd::{DevWorkspaceTemplateSpec, KubeResourceRef};
use serde::{Deserialize, Serialize};

/// DevWorkspace Custom Resource Definition
///
/// One user's containerized development environment. The controller resolves
/// the embedded devfile template, provisions storage, access control, routing
/// and a workload for it, and tears everything down again on stop or delete.
///
/// # Example
///
/// ```yaml
/// apiVersion: workspace.devfile.io/v1alpha2
/// kind: DevWorkspace
/// metadata:
///   name: my-workspace
///   namespace: user-ns
/// spec:
///   started: true
///   routingClass: basic
///   template:
///     components:
///       - name: tooling
///         container:
///           image: quay.io/devfile/universal-developer-image:latest
/// ```
#[derive(
    kube::CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema,
)]
#[kube(
    kind = "DevWorkspace",
    group = "workspace.devfile.io",
    version = "v1alpha2",
    namespaced,
    status = "crate::crd::DevWorkspaceStatus",
    shortname = "dw",
    printcolumn = r#"{"name":"DevWorkspace ID", "type":"string", "jsonPath":".status.devworkspaceId"}, {"name":"Phase", "type":"string", "jsonPath":".status.phase"}, {"name":"Info", "type":"string", "jsonPath":".status.message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DevWorkspaceSpec {
    /// Whether the workspace should be running
    #[serde(default)]
    pub started: bool,
    /// Routing class handed to the routing layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_class: Option<String>,
    /// Devfile template describing the workspace
    #[serde(default)]
    pub template: DevWorkspaceTemplateSpec,
    /// Plugins contributed on top of the template
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contributions: Vec<ComponentContribution>,
}

/// A plugin contributed to the workspace from outside its devfile
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentContribution {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubeResourceRef>,
}

impl DevWorkspace {
    /// `namespace/name` key used in logs and backoff bookkeeping
    #[must_use]
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or("default"),
            self.metadata.name.as_deref().unwrap_or("unknown")
        )
    }

    /// Annotation value, if present
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }

    /// Label value, if present
    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    /// Finalizers currently set on the resource
    #[must_use]
    pub fn finalizers(&self) -> &[String] {
        self.metadata.finalizers.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    /// Workspace identifier from status; empty until allocated
    #[must_use]
    pub fn workspace_id(&self) -> &str {
        self.status
            .as_ref()
            .map_or("", |status| status.devworkspace_id.as_str())
    }

    #[must_use]
    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or_default()
    }
}
