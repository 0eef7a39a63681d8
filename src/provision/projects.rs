//! # Projects
//!
//! Validation of project references and the `project-clone` init container
//! that populates `/projects` before the workspace starts.

use crate::constants::{
    PROJECTS_ROOT, PROJECTS_VOLUME, PROJECT_CLONE_ATTRIBUTE, PROJECT_CLONE_CONTAINER,
};
use crate::crd::{DevWorkspaceTemplateSpec, Project};
use k8s_openapi::api::core::v1::{Container, EnvVar, ResourceRequirements, VolumeMount};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path};

/// Attribute value that turns project cloning off
pub const PROJECT_CLONE_DISABLE: &str = "disable";

/// Problems with the template's projects; empty when valid
///
/// Names must be unique across projects, starter projects and dependent
/// projects. Clone paths must be relative and stay inside `/projects`.
#[must_use]
pub fn validate_projects(template: &DevWorkspaceTemplateSpec) -> Vec<String> {
    let mut problems = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    let all: Vec<&Project> = template
        .projects
        .iter()
        .chain(&template.starter_projects)
        .chain(&template.dependent_projects)
        .collect();

    for project in &all {
        if !seen.insert(project.name.as_str()) {
            problems.push(format!("duplicate project name '{}'", project.name));
        }
    }

    for project in template.projects.iter().chain(&template.dependent_projects) {
        let clone_path = project.effective_clone_path();
        if !clone_path_is_contained(clone_path) {
            problems.push(format!(
                "project '{}' has invalid clone path '{clone_path}': must be relative and stay within {PROJECTS_ROOT}",
                project.name
            ));
        }
    }

    problems
}

fn clone_path_is_contained(clone_path: &str) -> bool {
    let path = Path::new(clone_path);
    if path.is_absolute() {
        return false;
    }
    let mut depth: i32 = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    depth > 0
}

/// Init container that clones the template's projects
///
/// `None` when there is nothing to clone, no image is configured, or the
/// template opts out with `controller.devfile.io/project-clone: disable`.
#[must_use]
pub fn project_clone_container(
    template: &DevWorkspaceTemplateSpec,
    image: &str,
) -> Option<Container> {
    if template.projects.is_empty() && template.dependent_projects.is_empty() {
        return None;
    }
    if image.is_empty() || template.attribute(PROJECT_CLONE_ATTRIBUTE) == Some(PROJECT_CLONE_DISABLE) {
        return None;
    }

    let quantity = |value: &str| Quantity(value.to_string());
    Some(Container {
        name: PROJECT_CLONE_CONTAINER.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: Some(vec![EnvVar {
            name: "PROJECTS_ROOT".to_string(),
            value: Some(PROJECTS_ROOT.to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: PROJECTS_VOLUME.to_string(),
            mount_path: PROJECTS_ROOT.to_string(),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            limits: Some(BTreeMap::from([
                ("memory".to_string(), quantity("1Gi")),
                ("cpu".to_string(), quantity("1000m")),
            ])),
            requests: Some(BTreeMap::from([
                ("memory".to_string(), quantity("128Mi")),
                ("cpu".to_string(), quantity("100m")),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    })
}
