//! # Workspace RBAC
//!
//! One Role and one RoleBinding per namespace. Every workspace's service
//! account is a subject of the binding; finalization removes it again and
//! deletes both objects once the last subject is gone.

use crate::controller::reconciler::ProvisionError;
use crate::crd::DevWorkspace;
use crate::provision::basic::{apply, is_status, namespace_of, service_account_name};
use crate::provision::AccessController;
use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::info;

pub const WORKSPACE_ROLE_NAME: &str = "devworkspace-default-role";
pub const WORKSPACE_ROLE_BINDING_NAME: &str = "devworkspace-default-rolebinding";

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let owned = |values: &[&str]| Some(values.iter().map(|v| (*v).to_string()).collect());
    PolicyRule {
        api_groups: owned(groups),
        resources: owned(resources),
        verbs: owned(verbs).unwrap_or_default(),
        ..Default::default()
    }
}

fn workspace_role(namespace: &str) -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some(WORKSPACE_ROLE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        rules: Some(vec![
            rule(&[""], &["pods/exec"], &["create"]),
            rule(&[""], &["pods"], &["get", "list", "watch"]),
            rule(&["apps"], &["deployments", "replicasets"], &["get", "list", "watch"]),
            rule(
                &["workspace.devfile.io"],
                &["devworkspaces"],
                &["get", "list", "watch", "patch", "update"],
            ),
        ]),
    }
}

fn subject(workspace: &DevWorkspace, namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: service_account_name(workspace),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Role and RoleBinding granting workspace service accounts access to their pods
#[derive(Clone)]
pub struct KubeAccessController {
    client: Client,
}

impl std::fmt::Debug for KubeAccessController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeAccessController").finish_non_exhaustive()
    }
}

impl KubeAccessController {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn write_subjects(
        &self,
        bindings: &Api<RoleBinding>,
        subjects: Vec<Subject>,
    ) -> Result<(), ProvisionError> {
        bindings
            .patch(
                WORKSPACE_ROLE_BINDING_NAME,
                &PatchParams::default(),
                &Patch::Merge(json!({ "subjects": subjects })),
            )
            .await
            .context("failed to update workspace RoleBinding subjects")?;
        Ok(())
    }
}

#[async_trait]
impl AccessController for KubeAccessController {
    async fn sync(&self, workspace: &DevWorkspace) -> Result<(), ProvisionError> {
        let namespace = namespace_of(workspace)?;
        let roles: Api<Role> = Api::namespaced(self.client.clone(), &namespace);
        apply(&roles, WORKSPACE_ROLE_NAME, &workspace_role(&namespace)).await?;

        let bindings: Api<RoleBinding> = Api::namespaced(self.client.clone(), &namespace);
        let wanted = subject(workspace, &namespace);
        let existing = bindings
            .get_opt(WORKSPACE_ROLE_BINDING_NAME)
            .await
            .context("failed to read workspace RoleBinding")?;

        match existing {
            Some(binding) => {
                let mut subjects = binding.subjects.unwrap_or_default();
                if subjects.contains(&wanted) {
                    return Ok(());
                }
                subjects.push(wanted);
                self.write_subjects(&bindings, subjects).await
            }
            None => {
                let binding = RoleBinding {
                    metadata: ObjectMeta {
                        name: Some(WORKSPACE_ROLE_BINDING_NAME.to_string()),
                        namespace: Some(namespace.clone()),
                        ..Default::default()
                    },
                    role_ref: RoleRef {
                        api_group: "rbac.authorization.k8s.io".to_string(),
                        kind: "Role".to_string(),
                        name: WORKSPACE_ROLE_NAME.to_string(),
                    },
                    subjects: Some(vec![wanted]),
                };
                apply(&bindings, WORKSPACE_ROLE_BINDING_NAME, &binding).await?;
                info!("🔐 Created workspace RoleBinding in {}", namespace);
                Ok(())
            }
        }
    }

    async fn finalize(&self, workspace: &DevWorkspace) -> Result<(), ProvisionError> {
        let namespace = namespace_of(workspace)?;
        let bindings: Api<RoleBinding> = Api::namespaced(self.client.clone(), &namespace);
        let Some(binding) = bindings
            .get_opt(WORKSPACE_ROLE_BINDING_NAME)
            .await
            .context("failed to read workspace RoleBinding")?
        else {
            return Ok(());
        };

        let removed = subject(workspace, &namespace);
        let subjects: Vec<Subject> = binding
            .subjects
            .unwrap_or_default()
            .into_iter()
            .filter(|s| s != &removed)
            .collect();
        if !subjects.is_empty() {
            return self.write_subjects(&bindings, subjects).await;
        }

        for result in [
            bindings
                .delete(WORKSPACE_ROLE_BINDING_NAME, &DeleteParams::default())
                .await
                .map(|_| ()),
            Api::<Role>::namespaced(self.client.clone(), &namespace)
                .delete(WORKSPACE_ROLE_NAME, &DeleteParams::default())
                .await
                .map(|_| ()),
        ] {
            match result {
                Ok(()) => {}
                Err(err) if is_status(&err, 404) => {}
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context("failed to delete workspace RBAC")
                        .into())
                }
            }
        }
        info!("🧹 Removed workspace RBAC from {}", namespace);
        Ok(())
    }
}
