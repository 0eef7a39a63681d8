//! Template resolution for devfiles that need no flattening.

use crate::constants::PROJECTS_VOLUME;
use crate::controller::reconciler::{FailureReason, ProvisionError};
use crate::crd::{DevWorkspace, DevWorkspaceTemplateSpec};
use crate::provision::{ResolvedTemplate, TemplateResolver};
use async_trait::async_trait;
use std::collections::HashSet;

/// Accepts templates without parents, plugins or contributions as-is
///
/// Templates that would need flattening are rejected as bad requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughResolver;

fn bad_request(message: String) -> ProvisionError {
    ProvisionError::fail_with_reason(message, FailureReason::BadRequest)
}

#[async_trait]
impl TemplateResolver for PassthroughResolver {
    async fn resolve(&self, workspace: &DevWorkspace) -> Result<ResolvedTemplate, ProvisionError> {
        let template = &workspace.spec.template;
        if template.parent.is_some() {
            return Err(bad_request(
                "parent devfiles are not supported by this controller".to_string(),
            ));
        }
        if let Some(plugin) = template.components.iter().find(|c| c.plugin.is_some()) {
            return Err(bad_request(format!(
                "plugin component '{}' cannot be resolved",
                plugin.name
            )));
        }
        if let Some(contribution) = workspace.spec.contributions.first() {
            return Err(bad_request(format!(
                "contribution '{}' cannot be resolved",
                contribution.name
            )));
        }
        Ok(ResolvedTemplate {
            template: template.clone(),
            warnings: Vec::new(),
        })
    }

    fn validate_components(
        &self,
        template: &DevWorkspaceTemplateSpec,
    ) -> Result<(), ProvisionError> {
        let mut names = HashSet::new();
        let volumes: HashSet<&str> = template
            .components
            .iter()
            .filter(|c| c.volume.is_some())
            .map(|c| c.name.as_str())
            .collect();

        for component in &template.components {
            if !names.insert(component.name.as_str()) {
                return Err(bad_request(format!(
                    "duplicate component name '{}'",
                    component.name
                )));
            }
            if component.kind_count() != 1 {
                return Err(bad_request(format!(
                    "component '{}' must define exactly one component type",
                    component.name
                )));
            }
            let Some(container) = &component.container else {
                continue;
            };
            if container.image.trim().is_empty() {
                return Err(bad_request(format!(
                    "container component '{}' has no image",
                    component.name
                )));
            }
            if let Some(mount) = container
                .volume_mounts
                .iter()
                .find(|m| m.name != PROJECTS_VOLUME && !volumes.contains(m.name.as_str()))
            {
                return Err(bad_request(format!(
                    "container component '{}' mounts undefined volume '{}'",
                    component.name, mount.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        Component, ContainerComponent, DevWorkspaceSpec, ParentRef, VolumeComponent,
        VolumeMountDef,
    };

    fn container(name: &str, image: &str, mounts: &[&str]) -> Component {
        Component {
            name: name.to_string(),
            container: Some(ContainerComponent {
                image: image.to_string(),
                volume_mounts: mounts
                    .iter()
                    .map(|m| VolumeMountDef {
                        name: (*m).to_string(),
                        path: None,
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn volume(name: &str) -> Component {
        Component {
            name: name.to_string(),
            volume: Some(VolumeComponent::default()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_parent_is_rejected() {
        let ws = DevWorkspace::new(
            "ws",
            DevWorkspaceSpec {
                template: DevWorkspaceTemplateSpec {
                    parent: Some(ParentRef {
                        id: Some("java-maven".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        match PassthroughResolver.resolve(&ws).await {
            Err(ProvisionError::Fail { reason, .. }) => {
                assert_eq!(reason, Some(FailureReason::BadRequest));
            }
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_components() {
        let test_cases = vec![
            (vec![container("a", "img", &["data"]), volume("data")], true),
            (vec![container("a", "img", &["projects"])], true),
            (vec![container("a", "img", &[]), volume("a")], false),
            (vec![container("a", " ", &[])], false),
            (vec![container("a", "img", &["missing"])], false),
            (
                vec![Component {
                    name: "both".to_string(),
                    container: container("x", "img", &[]).container,
                    volume: Some(VolumeComponent::default()),
                    ..Default::default()
                }],
                false,
            ),
        ];
        for (components, valid) in test_cases {
            let names: Vec<String> = components.iter().map(|c| c.name.clone()).collect();
            let template = DevWorkspaceTemplateSpec {
                components,
                ..Default::default()
            };
            assert_eq!(
                PassthroughResolver.validate_components(&template).is_ok(),
                valid,
                "components {names:?}"
            );
        }
    }
}
