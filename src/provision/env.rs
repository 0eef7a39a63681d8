//! # Workspace Environment
//!
//! Environment variables every workspace container receives. A value the
//! container already declares wins over the injected one.

use crate::constants::PROJECTS_ROOT;
use crate::crd::{DevWorkspace, DevWorkspaceTemplateSpec};
use crate::provision::PodAdditions;
use k8s_openapi::api::core::v1::EnvVar;
use kube::ResourceExt;

/// Common variables for a workspace
#[must_use]
pub fn common_env(workspace: &DevWorkspace, template: &DevWorkspaceTemplateSpec) -> Vec<(String, String)> {
    let mut vars = vec![
        ("DEVWORKSPACE_NAME".to_string(), workspace.name_any()),
        (
            "DEVWORKSPACE_NAMESPACE".to_string(),
            workspace.namespace().unwrap_or_default(),
        ),
        (
            "DEVWORKSPACE_ID".to_string(),
            workspace.workspace_id().to_string(),
        ),
        ("PROJECTS_ROOT".to_string(), PROJECTS_ROOT.to_string()),
    ];
    if let Some(first) = template.projects.first() {
        vars.push((
            "PROJECT_SOURCE".to_string(),
            format!("{PROJECTS_ROOT}/{}", first.effective_clone_path()),
        ));
    }
    vars
}

/// Add `vars` to every container that does not already set them
pub fn inject_env(pod: &mut PodAdditions, vars: &[(String, String)]) {
    for container in pod.all_containers_mut() {
        let env = container.env.get_or_insert_with(Vec::new);
        for (name, value) in vars {
            if !env.iter().any(|e| &e.name == name) {
                env.push(EnvVar {
                    name: name.clone(),
                    value: Some(value.clone()),
                    ..Default::default()
                });
            }
        }
    }
}
