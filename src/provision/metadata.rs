//! # Workspace Metadata
//!
//! A ConfigMap holding the workspace's original and flattened templates,
//! mounted into every container so in-workspace tooling (project clone
//! included) can read the resolved devfile.

use crate::constants::{
    DEVWORKSPACE_ID_LABEL, METADATA_FLATTENED_KEY, METADATA_MOUNT_PATH, METADATA_ORIGINAL_KEY,
};
use crate::crd::{DevWorkspace, DevWorkspaceTemplateSpec};
use crate::provision::env::inject_env;
use crate::provision::PodAdditions;
use k8s_openapi::api::core::v1::{ConfigMap, ConfigMapVolumeSource, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

const METADATA_VOLUME: &str = "workspace-metadata";

#[must_use]
pub fn metadata_config_map_name(workspace_id: &str) -> String {
    format!("{workspace_id}-metadata")
}

/// ConfigMap describing the original and flattened templates
///
/// # Errors
///
/// Returns the serialization error if either template cannot be encoded.
pub fn metadata_config_map(
    workspace: &DevWorkspace,
    flattened: &DevWorkspaceTemplateSpec,
) -> Result<ConfigMap, serde_yaml::Error> {
    let workspace_id = workspace.workspace_id();
    let data = BTreeMap::from([
        (
            METADATA_ORIGINAL_KEY.to_string(),
            serde_yaml::to_string(&workspace.spec.template)?,
        ),
        (
            METADATA_FLATTENED_KEY.to_string(),
            serde_yaml::to_string(flattened)?,
        ),
    ]);
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(metadata_config_map_name(workspace_id)),
            namespace: workspace.namespace(),
            labels: Some(BTreeMap::from([(
                DEVWORKSPACE_ID_LABEL.to_string(),
                workspace_id.to_string(),
            )])),
            owner_references: workspace.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

/// Mount the metadata ConfigMap read-only and point `DEVWORKSPACE_METADATA` at it
pub fn mount_metadata(pod: &mut PodAdditions, workspace_id: &str) {
    pod.volumes.push(Volume {
        name: METADATA_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: metadata_config_map_name(workspace_id),
            ..Default::default()
        }),
        ..Default::default()
    });
    for container in pod.all_containers_mut() {
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(VolumeMount {
                name: METADATA_VOLUME.to_string(),
                mount_path: METADATA_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
    }
    inject_env(
        pod,
        &[(
            "DEVWORKSPACE_METADATA".to_string(),
            METADATA_MOUNT_PATH.to_string(),
        )],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DevWorkspaceSpec, DevWorkspaceStatus};
    use k8s_openapi::api::core::v1::Container;

    fn workspace() -> DevWorkspace {
        let mut ws = DevWorkspace::new("my-ws", DevWorkspaceSpec::default());
        ws.metadata.namespace = Some("user-ns".to_string());
        ws.metadata.uid = Some("0f8fad5b-d9cb-469f-a165-70867728950e".to_string());
        ws.status = Some(DevWorkspaceStatus {
            devworkspace_id: "workspace0f8fad5bd9cb469f".to_string(),
            ..Default::default()
        });
        ws
    }

    #[test]
    fn test_metadata_config_map() {
        let flattened = DevWorkspaceTemplateSpec {
            attributes: BTreeMap::from([("origin".to_string(), "flattened-template".to_string())]),
            ..Default::default()
        };
        let cm = metadata_config_map(&workspace(), &flattened).unwrap();

        assert_eq!(cm.metadata.name.as_deref(), Some("workspace0f8fad5bd9cb469f-metadata"));
        assert_eq!(cm.metadata.namespace.as_deref(), Some("user-ns"));
        let owner = &cm.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.uid, "0f8fad5b-d9cb-469f-a165-70867728950e");

        let data = cm.data.unwrap();
        assert!(data[METADATA_FLATTENED_KEY].contains("origin: flattened-template"));
        assert!(data.contains_key(METADATA_ORIGINAL_KEY));
    }

    #[test]
    fn test_mount_metadata_reaches_init_containers() {
        let mut pod = PodAdditions {
            containers: vec![Container {
                name: "tooling".to_string(),
                ..Default::default()
            }],
            init_containers: vec![Container {
                name: "project-clone".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        mount_metadata(&mut pod, "workspace1");

        assert_eq!(pod.volumes.len(), 1);
        for container in pod.containers.iter().chain(&pod.init_containers) {
            let mount = &container.volume_mounts.as_ref().unwrap()[0];
            assert_eq!(mount.mount_path, METADATA_MOUNT_PATH);
            let env = container.env.as_ref().unwrap();
            assert!(env.iter().any(|e| e.name == "DEVWORKSPACE_METADATA"));
        }
    }
}
