//! # Service Account Token Mounts
//!
//! Volume components carrying `controller.devfile.io/mount-sa-token` become
//! projected service account token volumes for the attribute's audience.

use crate::constants::{MOUNT_SA_TOKEN_ATTRIBUTE, SA_TOKEN_MOUNT_ROOT};
use crate::crd::{Component, DevWorkspaceTemplateSpec};
use crate::provision::PodAdditions;
use k8s_openapi::api::core::v1::{
    ProjectedVolumeSource, ServiceAccountTokenProjection, Volume, VolumeMount, VolumeProjection,
};

const TOKEN_EXPIRATION_SECONDS: i64 = 3600;

/// Audience of a token volume component, if it is one
#[must_use]
pub fn token_audience(component: &Component) -> Option<&str> {
    component.volume.as_ref()?;
    component
        .attributes
        .get(MOUNT_SA_TOKEN_ATTRIBUTE)
        .map(String::as_str)
        .filter(|audience| !audience.is_empty())
}

/// Storage provisioners skip these; they are not backed by storage
#[must_use]
pub fn is_token_volume(component: &Component) -> bool {
    token_audience(component).is_some()
}

/// Projected token volumes, mounted into every container
///
/// Containers that already mount the volume keep their own mount path.
#[must_use]
pub fn token_additions(template: &DevWorkspaceTemplateSpec, pod: &mut PodAdditions) -> usize {
    let mut added = 0;
    for component in &template.components {
        let Some(audience) = token_audience(component) else {
            continue;
        };
        if pod.has_volume(&component.name) {
            continue;
        }
        pod.volumes.push(Volume {
            name: component.name.clone(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![VolumeProjection {
                    service_account_token: Some(ServiceAccountTokenProjection {
                        audience: Some(audience.to_string()),
                        expiration_seconds: Some(TOKEN_EXPIRATION_SECONDS),
                        path: "token".to_string(),
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
        for container in pod.all_containers_mut() {
            let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
            if mounts.iter().any(|m| m.name == component.name) {
                continue;
            }
            mounts.push(VolumeMount {
                name: component.name.clone(),
                mount_path: format!("{SA_TOKEN_MOUNT_ROOT}/{}", component.name),
                read_only: Some(true),
                ..Default::default()
            });
        }
        added += 1;
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::VolumeComponent;
    use k8s_openapi::api::core::v1::Container;
    use std::collections::BTreeMap;

    #[test]
    fn test_token_volume_mounted_into_all_containers() {
        let template = DevWorkspaceTemplateSpec {
            components: vec![
                Component {
                    name: "vault-token".to_string(),
                    attributes: BTreeMap::from([(
                        MOUNT_SA_TOKEN_ATTRIBUTE.to_string(),
                        "vault".to_string(),
                    )]),
                    volume: Some(VolumeComponent::default()),
                    ..Default::default()
                },
                Component {
                    name: "data".to_string(),
                    volume: Some(VolumeComponent::default()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let mut pod = PodAdditions {
            containers: vec![
                Container {
                    name: "a".to_string(),
                    ..Default::default()
                },
                Container {
                    name: "b".to_string(),
                    volume_mounts: Some(vec![VolumeMount {
                        name: "vault-token".to_string(),
                        mount_path: "/custom".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        assert_eq!(token_additions(&template, &mut pod), 1);
        assert_eq!(pod.volumes.len(), 1);
        let projection = pod.volumes[0].projected.as_ref().unwrap().sources.as_ref().unwrap();
        assert_eq!(
            projection[0].service_account_token.as_ref().unwrap().audience.as_deref(),
            Some("vault")
        );

        let path = |container: &Container| {
            container.volume_mounts.as_ref().unwrap()[0].mount_path.clone()
        };
        assert_eq!(path(&pod.containers[0]), "/var/run/secrets/tokens/vault-token");
        assert_eq!(path(&pod.containers[1]), "/custom");
        assert_eq!(pod.containers[1].volume_mounts.as_ref().unwrap().len(), 1);
        assert!(!is_token_volume(&template.components[1]));
    }
}
