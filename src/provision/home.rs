//! # Persistent Home
//!
//! Adds a `persistent-home` volume component mounted at `/home/user` in
//! every container, so the user's home directory survives restarts.

use crate::constants::{PERSISTENT_HOME_MOUNT_PATH, PERSISTENT_HOME_VOLUME};
use crate::crd::{Component, DevWorkspaceTemplateSpec, VolumeComponent, VolumeMountDef};

/// Whether the template should get a persistent home volume
///
/// A container that already mounts something at `/home/user` takes precedence.
#[must_use]
pub fn needs_persistent_home(template: &DevWorkspaceTemplateSpec) -> bool {
    !template
        .components
        .iter()
        .filter_map(|c| c.container.as_ref())
        .flat_map(|c| &c.volume_mounts)
        .any(|m| m.path.as_deref() == Some(PERSISTENT_HOME_MOUNT_PATH))
}

/// Add the persistent home volume to `template`
///
/// # Errors
///
/// Returns a message, and leaves the template untouched, when a component
/// already uses the volume name.
pub fn add_persistent_home(template: &mut DevWorkspaceTemplateSpec) -> Result<(), String> {
    if template
        .components
        .iter()
        .any(|c| c.name == PERSISTENT_HOME_VOLUME)
    {
        return Err(format!(
            "addition of {PERSISTENT_HOME_VOLUME} volume would render DevWorkspace invalid: component name '{PERSISTENT_HOME_VOLUME}' is already in use"
        ));
    }

    for container in template
        .components
        .iter_mut()
        .filter_map(|c| c.container.as_mut())
    {
        container.volume_mounts.push(VolumeMountDef {
            name: PERSISTENT_HOME_VOLUME.to_string(),
            path: Some(PERSISTENT_HOME_MOUNT_PATH.to_string()),
        });
    }
    template.components.push(Component {
        name: PERSISTENT_HOME_VOLUME.to_string(),
        volume: Some(VolumeComponent::default()),
        ..Default::default()
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ContainerComponent;

    fn container(name: &str, mounts: Vec<VolumeMountDef>) -> Component {
        Component {
            name: name.to_string(),
            container: Some(ContainerComponent {
                image: "img".to_string(),
                volume_mounts: mounts,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_add_persistent_home_mounts_every_container() {
        let mut template = DevWorkspaceTemplateSpec {
            components: vec![container("a", vec![]), container("b", vec![])],
            ..Default::default()
        };
        assert!(needs_persistent_home(&template));
        add_persistent_home(&mut template).unwrap();

        assert_eq!(template.components.len(), 3);
        for component in template.components.iter().filter_map(|c| c.container.as_ref()) {
            assert!(component
                .volume_mounts
                .iter()
                .any(|m| m.name == PERSISTENT_HOME_VOLUME));
        }
        assert!(!needs_persistent_home(&template));
    }

    #[test]
    fn test_existing_home_mount_takes_precedence() {
        let template = DevWorkspaceTemplateSpec {
            components: vec![container(
                "a",
                vec![VolumeMountDef {
                    name: "mine".to_string(),
                    path: Some("/home/user".to_string()),
                }],
            )],
            ..Default::default()
        };
        assert!(!needs_persistent_home(&template));
    }

    #[test]
    fn test_name_conflict_is_reported() {
        let mut template = DevWorkspaceTemplateSpec {
            components: vec![container("persistent-home", vec![])],
            ..Default::default()
        };
        let before = template.clone();
        assert!(add_persistent_home(&mut template).is_err());
        assert_eq!(template, before);
    }
}
