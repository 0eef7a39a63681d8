//! # Automount
//!
//! Secrets and ConfigMaps labelled `controller.devfile.io/mount-to-devworkspace=true`
//! are mounted into every workspace container in their namespace.
//!
//! `controller.devfile.io/mount-as: env` exposes the object's keys as
//! environment variables instead of files. `controller.devfile.io/mount-path`
//! overrides the default `/etc/secret/<name>` or `/etc/config/<name>`.

use crate::constants::{
    DEVWORKSPACE_MOUNT_AS_ANNOTATION, DEVWORKSPACE_MOUNT_LABEL, DEVWORKSPACE_MOUNT_PATH_ANNOTATION,
};
use crate::controller::reconciler::ProvisionError;
use crate::crd::DevWorkspace;
use crate::provision::basic::namespace_of;
use crate::provision::{AutomountProvider, PodAdditions};
use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, ConfigMapVolumeSource, EnvFromSource, Secret, SecretEnvSource,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams};
use kube::{Client, Resource};

/// Which kind of object is being mounted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Secret,
    ConfigMap,
}

/// One object to mount
#[derive(Debug, Clone, PartialEq)]
struct Mountable {
    source: Source,
    name: String,
    mount_as_env: bool,
    mount_path: String,
}

impl Mountable {
    fn from_meta(source: Source, meta: &ObjectMeta) -> Self {
        let name = meta.name.clone().unwrap_or_default();
        let annotation = |key: &str| {
            meta.annotations
                .as_ref()
                .and_then(|a| a.get(key))
                .map(String::as_str)
                .filter(|v| !v.is_empty())
        };
        let default_root = match source {
            Source::Secret => "/etc/secret",
            Source::ConfigMap => "/etc/config",
        };
        Self {
            source,
            mount_as_env: annotation(DEVWORKSPACE_MOUNT_AS_ANNOTATION) == Some("env"),
            mount_path: annotation(DEVWORKSPACE_MOUNT_PATH_ANNOTATION)
                .map_or_else(|| format!("{default_root}/{name}"), str::to_string),
            name,
        }
    }

    fn volume_name(&self) -> String {
        let prefix = match self.source {
            Source::Secret => "secret",
            Source::ConfigMap => "configmap",
        };
        let mut name = format!("automount-{prefix}-{}", self.name);
        name.truncate(63);
        name
    }
}

/// Add volumes and mounts (or env sources) for `objects` to every container
fn mount(pod: &mut PodAdditions, objects: &[Mountable]) {
    for object in objects {
        if object.mount_as_env {
            let source = match object.source {
                Source::Secret => EnvFromSource {
                    secret_ref: Some(SecretEnvSource {
                        name: object.name.clone(),
                        optional: None,
                    }),
                    ..Default::default()
                },
                Source::ConfigMap => EnvFromSource {
                    config_map_ref: Some(ConfigMapEnvSource {
                        name: object.name.clone(),
                        optional: None,
                    }),
                    ..Default::default()
                },
            };
            for container in pod.all_containers_mut() {
                container
                    .env_from
                    .get_or_insert_with(Vec::new)
                    .push(source.clone());
            }
            continue;
        }

        let volume_name = object.volume_name();
        if pod.has_volume(&volume_name) {
            continue;
        }
        pod.volumes.push(match object.source {
            Source::Secret => Volume {
                name: volume_name.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(object.name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Source::ConfigMap => Volume {
                name: volume_name.clone(),
                config_map: Some(ConfigMapVolumeSource {
                    name: object.name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        });
        for container in pod.all_containers_mut() {
            container
                .volume_mounts
                .get_or_insert_with(Vec::new)
                .push(VolumeMount {
                    name: volume_name.clone(),
                    mount_path: object.mount_path.clone(),
                    read_only: Some(true),
                    ..Default::default()
                });
        }
    }
}

/// Lists labelled Secrets and ConfigMaps in the workspace namespace
#[derive(Clone)]
pub struct KubeAutomount {
    client: Client,
}

impl std::fmt::Debug for KubeAutomount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeAutomount").finish_non_exhaustive()
    }
}

impl KubeAutomount {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AutomountProvider for KubeAutomount {
    async fn provision(
        &self,
        workspace: &DevWorkspace,
        pod: &mut PodAdditions,
    ) -> Result<(), ProvisionError> {
        let namespace = namespace_of(workspace)?;
        let params = ListParams::default().labels(&format!("{DEVWORKSPACE_MOUNT_LABEL}=true"));

        let secrets = Api::<Secret>::namespaced(self.client.clone(), &namespace)
            .list(&params)
            .await
            .context("failed to list automount secrets")?;
        let config_maps = Api::<ConfigMap>::namespaced(self.client.clone(), &namespace)
            .list(&params)
            .await
            .context("failed to list automount configmaps")?;

        let mut objects: Vec<Mountable> = secrets
            .items
            .iter()
            .map(|s| Mountable::from_meta(Source::Secret, s.meta()))
            .chain(
                config_maps
                    .items
                    .iter()
                    .map(|c| Mountable::from_meta(Source::ConfigMap, c.meta())),
            )
            .collect();
        objects.sort_by(|a, b| a.volume_name().cmp(&b.volume_name()));

        mount(pod, &objects);
        Ok(())
    }
}
