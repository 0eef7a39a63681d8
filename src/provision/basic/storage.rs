//! # Storage Strategies
//!
//! - [`EphemeralStorage`]: every volume is an `emptyDir`.
//! - [`ClaimStorage`]: one `claim-devworkspace` PVC per namespace shared by
//!   all workspaces, each using `<id>/<volume>` sub-paths. Files are removed
//!   on deletion by a cleanup Job.
//! - [`PerWorkspaceStorage`]: one PVC per workspace, garbage collected with
//!   the workspace through its owner reference.

use crate::constants::{
    DEVWORKSPACE_PVC_TYPE_LABEL, PER_USER_STORAGE_TYPE, PER_WORKSPACE_STORAGE_TYPE, PROJECTS_VOLUME,
};
use crate::controller::reconciler::{FailureReason, ProvisionError};
use crate::crd::{DevWorkspace, DevWorkspaceTemplateSpec};
use crate::provision::basic::{apply, is_status, namespace_of, owned_by, workspace_labels};
use crate::provision::tokens::is_token_volume;
use crate::provision::{PodAdditions, StorageProvisioner};
use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Name of the PVC shared by workspaces using the per-user strategy
pub const SHARED_CLAIM_NAME: &str = "claim-devworkspace";

const DEFAULT_CLAIM_SIZE: &str = "10Gi";
const CLEANUP_IMAGE: &str = "registry.access.redhat.com/ubi9/ubi-minimal:latest";
const CLEANUP_MOUNT_PATH: &str = "/tmp/devworkspaces";
const CLEANUP_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Volumes of the template that need backing storage, by name
///
/// Token volumes are projected and never stored. Volumes marked ephemeral
/// are returned separately.
fn storage_volumes(template: &DevWorkspaceTemplateSpec) -> (Vec<String>, Vec<String>) {
    let mut persistent = Vec::new();
    let mut ephemeral = Vec::new();
    for component in &template.components {
        let Some(volume) = &component.volume else {
            continue;
        };
        if is_token_volume(component) {
            continue;
        }
        if volume.ephemeral.unwrap_or(false) {
            ephemeral.push(component.name.clone());
        } else {
            persistent.push(component.name.clone());
        }
    }
    let mounts_sources = template
        .components
        .iter()
        .filter_map(|c| c.container.as_ref())
        .any(|c| c.mount_sources.unwrap_or(true));
    if mounts_sources && !persistent.iter().any(|v| v == PROJECTS_VOLUME) {
        persistent.push(PROJECTS_VOLUME.to_string());
    }
    (persistent, ephemeral)
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn add_empty_dirs(pod: &mut PodAdditions, names: &[String]) {
    for name in names {
        if !pod.has_volume(name) {
            pod.volumes.push(empty_dir(name));
        }
    }
}

/// Point mounts of `volumes` at `claim`, each under its own sub-path
fn mount_on_claim(
    pod: &mut PodAdditions,
    volumes: &[String],
    claim: &str,
    sub_path: impl Fn(&str) -> String,
) {
    for container in pod.all_containers_mut() {
        for mount in container.volume_mounts.iter_mut().flatten() {
            if volumes.contains(&mount.name) {
                mount.sub_path = Some(sub_path(&mount.name));
                mount.name = claim.to_string();
            }
        }
    }
    if !pod.has_volume(claim) {
        pod.volumes.push(Volume {
            name: claim.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.to_string(),
                read_only: None,
            }),
            ..Default::default()
        });
    }
}

fn claim(name: &str, storage_type: &str, size: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                DEVWORKSPACE_PVC_TYPE_LABEL.to_string(),
                storage_type.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Create the claim unless it already exists; existing claims are never resized
async fn ensure_claim(
    api: &Api<PersistentVolumeClaim>,
    desired: &PersistentVolumeClaim,
) -> Result<(), ProvisionError> {
    let name = desired.metadata.name.clone().unwrap_or_default();
    let existing = api
        .get_opt(&name)
        .await
        .with_context(|| format!("failed to read PersistentVolumeClaim {name}"))?;
    if let Some(existing) = existing {
        if existing.metadata.deletion_timestamp.is_some() {
            return Err(ProvisionError::retry(
                format!("Waiting for previous PersistentVolumeClaim {name} to be deleted"),
                CLEANUP_POLL_INTERVAL,
            ));
        }
        return Ok(());
    }
    match api.create(&PostParams::default(), desired).await {
        Ok(_) => {
            info!("💾 Created PersistentVolumeClaim {}", name);
            Ok(())
        }
        Err(err) if is_status(&err, 409) => Ok(()),
        Err(err) => Err(anyhow::Error::new(err)
            .context(format!("failed to create PersistentVolumeClaim {name}"))
            .into()),
    }
}

/// Every volume is an `emptyDir`; nothing to clean up
#[derive(Debug, Clone, Copy, Default)]
pub struct EphemeralStorage;

#[async_trait]
impl StorageProvisioner for EphemeralStorage {
    fn needs_storage(&self, _template: &DevWorkspaceTemplateSpec) -> bool {
        false
    }

    async fn provision_storage(
        &self,
        pod: &mut PodAdditions,
        _workspace: &DevWorkspace,
        template: &DevWorkspaceTemplateSpec,
    ) -> Result<(), ProvisionError> {
        let (persistent, ephemeral) = storage_volumes(template);
        add_empty_dirs(pod, &persistent);
        add_empty_dirs(pod, &ephemeral);
        Ok(())
    }

    async fn cleanup_storage(&self, _workspace: &DevWorkspace) -> Result<(), ProvisionError> {
        Ok(())
    }
}

/// Shared namespace claim with per-workspace sub-paths
#[derive(Clone)]
pub struct ClaimStorage {
    client: Client,
}

impl std::fmt::Debug for ClaimStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimStorage").finish_non_exhaustive()
    }
}

impl ClaimStorage {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn cleanup_job(workspace: &DevWorkspace, namespace: &str) -> Job {
        let workspace_id = workspace.workspace_id();
        Job {
            metadata: ObjectMeta {
                name: Some(cleanup_job_name(workspace_id)),
                namespace: Some(namespace.to_string()),
                labels: Some(workspace_labels(workspace)),
                owner_references: owned_by(workspace),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(3),
                completions: Some(1),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(workspace_labels(workspace)),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "cleanup".to_string(),
                            image: Some(CLEANUP_IMAGE.to_string()),
                            command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
                            args: Some(vec![format!(
                                "rm -rf {CLEANUP_MOUNT_PATH}/{workspace_id}"
                            )]),
                            volume_mounts: Some(vec![VolumeMount {
                                name: SHARED_CLAIM_NAME.to_string(),
                                mount_path: CLEANUP_MOUNT_PATH.to_string(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        volumes: Some(vec![Volume {
                            name: SHARED_CLAIM_NAME.to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: SHARED_CLAIM_NAME.to_string(),
                                read_only: None,
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn cleanup_job_name(workspace_id: &str) -> String {
    format!("cleanup-{workspace_id}")
}

#[async_trait]
impl StorageProvisioner for ClaimStorage {
    fn needs_storage(&self, template: &DevWorkspaceTemplateSpec) -> bool {
        !storage_volumes(template).0.is_empty()
    }

    async fn provision_storage(
        &self,
        pod: &mut PodAdditions,
        workspace: &DevWorkspace,
        template: &DevWorkspaceTemplateSpec,
    ) -> Result<(), ProvisionError> {
        let (persistent, ephemeral) = storage_volumes(template);
        add_empty_dirs(pod, &ephemeral);
        if persistent.is_empty() {
            return Ok(());
        }

        let namespace = namespace_of(workspace)?;
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        ensure_claim(
            &api,
            &claim(SHARED_CLAIM_NAME, PER_USER_STORAGE_TYPE, DEFAULT_CLAIM_SIZE),
        )
        .await?;

        let workspace_id = workspace.workspace_id().to_string();
        mount_on_claim(pod, &persistent, SHARED_CLAIM_NAME, |volume| {
            format!("{workspace_id}/{volume}")
        });
        Ok(())
    }

    async fn cleanup_storage(&self, workspace: &DevWorkspace) -> Result<(), ProvisionError> {
        let namespace = namespace_of(workspace)?;
        let claims: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &namespace);
        if claims
            .get_opt(SHARED_CLAIM_NAME)
            .await
            .context("failed to read shared PersistentVolumeClaim")?
            .is_none()
        {
            debug!("No shared claim in {}, nothing to clean up", namespace);
            return Ok(());
        }

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        let name = cleanup_job_name(workspace.workspace_id());
        let job = match jobs
            .get_opt(&name)
            .await
            .with_context(|| format!("failed to read cleanup job {name}"))?
        {
            Some(job) => job,
            None => {
                apply(&jobs, &name, &Self::cleanup_job(workspace, &namespace)).await?;
                info!("🧹 Started storage cleanup job {}/{}", namespace, name);
                return Err(ProvisionError::retry(
                    "Cleaning up workspace storage",
                    CLEANUP_POLL_INTERVAL,
                ));
            }
        };

        let status = job.status.unwrap_or_default();
        if status.succeeded.unwrap_or(0) > 0 {
            jobs.delete(&name, &DeleteParams::background())
                .await
                .map(|_| ())
                .or_else(|err| if is_status(&err, 404) { Ok(()) } else { Err(err) })
                .with_context(|| format!("failed to delete cleanup job {name}"))?;
            info!("✅ Workspace storage cleaned up by job {}/{}", namespace, name);
            return Ok(());
        }
        if status.failed.unwrap_or(0) > 0 {
            return Err(ProvisionError::fail_with_reason(
                format!("DevWorkspace PVC cleanup job failed: see logs for job {namespace}/{name} for details"),
                FailureReason::InfrastructureFailure,
            ));
        }
        Err(ProvisionError::retry(
            "Cleaning up workspace storage",
            CLEANUP_POLL_INTERVAL,
        ))
    }
}

/// One claim per workspace, removed with the workspace by garbage collection
#[derive(Clone)]
pub struct PerWorkspaceStorage {
    client: Client,
}

impl std::fmt::Debug for PerWorkspaceStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerWorkspaceStorage").finish_non_exhaustive()
    }
}

impl PerWorkspaceStorage {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Claim name for a per-workspace PVC
#[must_use]
pub fn per_workspace_claim_name(workspace_id: &str) -> String {
    format!("storage-{workspace_id}")
}

#[async_trait]
impl StorageProvisioner for PerWorkspaceStorage {
    fn needs_storage(&self, template: &DevWorkspaceTemplateSpec) -> bool {
        !storage_volumes(template).0.is_empty()
    }

    async fn provision_storage(
        &self,
        pod: &mut PodAdditions,
        workspace: &DevWorkspace,
        template: &DevWorkspaceTemplateSpec,
    ) -> Result<(), ProvisionError> {
        let (persistent, ephemeral) = storage_volumes(template);
        add_empty_dirs(pod, &ephemeral);
        if persistent.is_empty() {
            return Ok(());
        }

        let namespace = namespace_of(workspace)?;
        let name = per_workspace_claim_name(workspace.workspace_id());
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        let mut desired = claim(&name, PER_WORKSPACE_STORAGE_TYPE, DEFAULT_CLAIM_SIZE);
        desired.metadata.owner_references = owned_by(workspace);
        ensure_claim(&api, &desired).await?;

        mount_on_claim(pod, &persistent, &name, str::to_string);
        debug!("Workspace volumes mounted from claim {}", name);
        Ok(())
    }

    async fn cleanup_storage(&self, _workspace: &DevWorkspace) -> Result<(), ProvisionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MOUNT_SA_TOKEN_ATTRIBUTE;
    use crate::crd::{Component, ContainerComponent, VolumeComponent};

    fn template(mount_sources: Option<bool>) -> DevWorkspaceTemplateSpec {
        DevWorkspaceTemplateSpec {
            components: vec![
                Component {
                    name: "tooling".to_string(),
                    container: Some(ContainerComponent {
                        image: "img".to_string(),
                        mount_sources,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Component {
                    name: "m2".to_string(),
                    volume: Some(VolumeComponent::default()),
                    ..Default::default()
                },
                Component {
                    name: "cache".to_string(),
                    volume: Some(VolumeComponent {
                        ephemeral: Some(true),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Component {
                    name: "token".to_string(),
                    attributes: BTreeMap::from([(
                        MOUNT_SA_TOKEN_ATTRIBUTE.to_string(),
                        "vault".to_string(),
                    )]),
                    volume: Some(VolumeComponent::default()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_storage_volumes_split() {
        let (persistent, ephemeral) = storage_volumes(&template(None));
        assert_eq!(persistent, vec!["m2", "projects"]);
        assert_eq!(ephemeral, vec!["cache"]);

        let (persistent, _) = storage_volumes(&template(Some(false)));
        assert_eq!(persistent, vec!["m2"]);
    }

    #[test]
    fn test_mount_on_claim_rewrites_mounts() {
        let mut pod = PodAdditions {
            containers: vec![Container {
                name: "tooling".to_string(),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: "m2".to_string(),
                        mount_path: "/home/user/.m2".to_string(),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: "cache".to_string(),
                        mount_path: "/cache".to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }],
            ..Default::default()
        };
        mount_on_claim(&mut pod, &["m2".to_string()], SHARED_CLAIM_NAME, |v| {
            format!("workspace1/{v}")
        });

        let mounts = pod.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].name, SHARED_CLAIM_NAME);
        assert_eq!(mounts[0].sub_path.as_deref(), Some("workspace1/m2"));
        assert_eq!(mounts[1].name, "cache");
        assert_eq!(pod.volumes.len(), 1);
        assert_eq!(
            pod.volumes[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            SHARED_CLAIM_NAME
        );
    }

    #[tokio::test]
    async fn test_ephemeral_storage_uses_empty_dirs() {
        let mut pod = PodAdditions::default();
        let ws = DevWorkspace::new("ws", Default::default());
        EphemeralStorage
            .provision_storage(&mut pod, &ws, &template(None))
            .await
            .unwrap();
        let names: Vec<&str> = pod.volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["m2", "projects", "cache"]);
        assert!(pod.volumes.iter().all(|v| v.empty_dir.is_some()));
        assert!(!EphemeralStorage.needs_storage(&template(None)));
    }
}
