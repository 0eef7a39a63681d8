//! # Workspace Deployment
//!
//! The workload is a single-replica Deployment named after the workspace
//! identifier. Pods of the Deployment are inspected for container states
//! that will never recover on their own, which fail the start attempt.

use crate::constants::DEVWORKSPACE_ID_LABEL;
use crate::controller::reconciler::{FailureReason, ProvisionError};
use crate::crd::DevWorkspace;
use crate::provision::basic::{apply, is_status, namespace_of, owned_by, workspace_labels};
use crate::provision::{PodAdditions, WorkloadSynchronizer};
use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

/// Container waiting reasons that fail the workspace instead of retrying
pub const UNRECOVERABLE_WAITING_REASONS: [&str; 5] = [
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "InvalidImageName",
];

const DEPLOYMENT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Deployment for the workspace's pod additions
#[must_use]
pub fn workspace_deployment(
    workspace: &DevWorkspace,
    namespace: &str,
    pod: &PodAdditions,
    service_account: &str,
) -> Deployment {
    let workspace_id = workspace.workspace_id();
    let mut pod_labels = workspace_labels(workspace);
    pod_labels.extend(pod.labels.clone());

    Deployment {
        metadata: ObjectMeta {
            name: Some(workspace_id.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(workspace_labels(workspace)),
            owner_references: owned_by(workspace),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    DEVWORKSPACE_ID_LABEL.to_string(),
                    workspace_id.to_string(),
                )])),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(workspace_id.to_string()),
                    labels: Some(pod_labels),
                    annotations: (!pod.annotations.is_empty()).then(|| pod.annotations.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: pod.containers.clone(),
                    init_containers: (!pod.init_containers.is_empty())
                        .then(|| pod.init_containers.clone()),
                    volumes: (!pod.volumes.is_empty()).then(|| pod.volumes.clone()),
                    image_pull_secrets: (!pod.pull_secrets.is_empty())
                        .then(|| pod.pull_secrets.clone()),
                    service_account_name: Some(service_account.to_string()),
                    termination_grace_period_seconds: Some(10),
                    restart_policy: Some("Always".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// First container stuck in a state that needs user action
fn unrecoverable_container(pod: &Pod) -> Option<(String, String)> {
    let status = pod.status.as_ref()?;
    status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten())
        .find_map(|container| {
            let reason = container
                .state
                .as_ref()?
                .waiting
                .as_ref()?
                .reason
                .as_deref()?;
            UNRECOVERABLE_WAITING_REASONS
                .contains(&reason)
                .then(|| (container.name.clone(), reason.to_string()))
        })
}

fn deployment_ready(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let generation = deployment.metadata.generation.unwrap_or(0);
    status.observed_generation.unwrap_or(0) >= generation
        && status.ready_replicas.unwrap_or(0) >= 1
        && status.updated_replicas.unwrap_or(0) >= 1
}

/// Applies and watches the workspace Deployment
#[derive(Clone)]
pub struct KubeDeploymentWorkload {
    client: Client,
}

impl std::fmt::Debug for KubeDeploymentWorkload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeDeploymentWorkload").finish_non_exhaustive()
    }
}

impl KubeDeploymentWorkload {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadSynchronizer for KubeDeploymentWorkload {
    async fn sync(
        &self,
        workspace: &DevWorkspace,
        pod: &PodAdditions,
        service_account: &str,
    ) -> Result<(), ProvisionError> {
        let namespace = namespace_of(workspace)?;
        let name = workspace.workspace_id().to_string();
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        let desired = workspace_deployment(workspace, &namespace, pod, service_account);
        let applied = apply(&deployments, &name, &desired).await?;
        if deployment_ready(&applied) {
            return Ok(());
        }

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let listed = pods
            .list(&ListParams::default().labels(&format!("{DEVWORKSPACE_ID_LABEL}={name}")))
            .await
            .context("failed to list workspace pods")?;
        if let Some((container, reason)) = listed.items.iter().find_map(unrecoverable_container) {
            return Err(ProvisionError::fail_with_reason(
                format!("Container {container} has state {reason}"),
                FailureReason::WorkspaceEngineFailure,
            ));
        }

        Err(ProvisionError::retry(
            "Waiting for workspace deployment",
            DEPLOYMENT_POLL_INTERVAL,
        ))
    }

    async fn scale_to_zero(&self, workspace: &DevWorkspace) -> Result<bool, ProvisionError> {
        let namespace = namespace_of(workspace)?;
        let name = workspace.workspace_id().to_string();
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        let Some(deployment) = deployments
            .get_opt(&name)
            .await
            .with_context(|| format!("failed to read deployment {name}"))?
        else {
            return Ok(true);
        };

        let desired_replicas = deployment.spec.as_ref().and_then(|s| s.replicas);
        if desired_replicas != Some(0) {
            deployments
                .patch(
                    &name,
                    &PatchParams::default(),
                    &Patch::Merge(json!({ "spec": { "replicas": 0 } })),
                )
                .await
                .with_context(|| format!("failed to scale deployment {name} to zero"))?;
            info!("⏸️  Scaled workspace deployment {}/{} to zero", namespace, name);
            return Ok(false);
        }

        let remaining = deployment
            .status
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        Ok(remaining == 0)
    }

    async fn delete(&self, workspace: &DevWorkspace) -> Result<bool, ProvisionError> {
        let namespace = namespace_of(workspace)?;
        let name = workspace.workspace_id().to_string();
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        let Some(deployment) = deployments
            .get_opt(&name)
            .await
            .with_context(|| format!("failed to read deployment {name}"))?
        else {
            return Ok(false);
        };
        if deployment.metadata.deletion_timestamp.is_some() {
            return Ok(true);
        }
        match deployments.delete(&name, &DeleteParams::background()).await {
            Ok(_) => {
                info!("🗑️  Deleting workspace deployment {}/{}", namespace, name);
                Ok(true)
            }
            Err(err) if is_status(&err, 404) => Ok(false),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("failed to delete deployment {name}"))
                .into()),
        }
    }
}
