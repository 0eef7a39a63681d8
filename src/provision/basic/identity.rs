//! Workspace service accounts and the image pull secrets attached to them.

use crate::constants::DEVWORKSPACE_PULL_SECRET_LABEL;
use crate::controller::reconciler::ProvisionError;
use crate::crd::DevWorkspace;
use crate::provision::basic::{
    apply, is_status, namespace_of, owned_by, service_account_name, workspace_labels,
};
use crate::provision::{IdentitySynchronizer, PodAdditions, PullSecretSynchronizer};
use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LocalObjectReference, Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Creates `<id>-sa` for each workspace
#[derive(Clone)]
pub struct KubeIdentity {
    client: Client,
}

impl std::fmt::Debug for KubeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeIdentity").finish_non_exhaustive()
    }
}

impl KubeIdentity {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IdentitySynchronizer for KubeIdentity {
    async fn sync_service_account(
        &self,
        workspace: &DevWorkspace,
        annotations: &BTreeMap<String, String>,
    ) -> Result<String, ProvisionError> {
        let namespace = namespace_of(workspace)?;
        let name = service_account_name(workspace);
        let account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(workspace_labels(workspace)),
                annotations: (!annotations.is_empty()).then(|| annotations.clone()),
                owner_references: owned_by(workspace),
                ..Default::default()
            },
            automount_service_account_token: Some(true),
            ..Default::default()
        };
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &namespace);
        apply(&api, &name, &account).await?;
        Ok(name)
    }

    async fn finalize_legacy(&self, workspace: &DevWorkspace) -> Result<bool, ProvisionError> {
        let namespace = namespace_of(workspace)?;
        let name = service_account_name(workspace);
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &namespace);
        let Some(account) = api
            .get_opt(&name)
            .await
            .with_context(|| format!("failed to read service account {name}"))?
        else {
            return Ok(false);
        };
        if account.metadata.deletion_timestamp.is_some() {
            return Ok(true);
        }
        match api.delete(&name, &DeleteParams::background()).await {
            Ok(_) => {
                info!("🧹 Deleted legacy workspace service account {}/{}", namespace, name);
                Ok(true)
            }
            Err(err) if is_status(&err, 404) => Ok(false),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("failed to delete service account {name}"))
                .into()),
        }
    }
}

/// Attaches secrets labelled `controller.devfile.io/devworkspace_pullsecret=true`
#[derive(Clone)]
pub struct KubePullSecrets {
    client: Client,
}

impl std::fmt::Debug for KubePullSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubePullSecrets").finish_non_exhaustive()
    }
}

impl KubePullSecrets {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PullSecretSynchronizer for KubePullSecrets {
    async fn sync(
        &self,
        workspace: &DevWorkspace,
        service_account: &str,
    ) -> Result<PodAdditions, ProvisionError> {
        let namespace = namespace_of(workspace)?;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let mut names: Vec<String> = secrets
            .list(&ListParams::default().labels(&format!("{DEVWORKSPACE_PULL_SECRET_LABEL}=true")))
            .await
            .context("failed to list image pull secrets")?
            .items
            .iter()
            .map(ResourceExt::name_any)
            .collect();
        names.sort();

        let pull_secrets: Vec<LocalObjectReference> = names
            .into_iter()
            .map(|name| LocalObjectReference { name })
            .collect();

        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &namespace);
        if let Some(account) = accounts
            .get_opt(service_account)
            .await
            .with_context(|| format!("failed to read service account {service_account}"))?
        {
            if account.image_pull_secrets.as_ref() != Some(&pull_secrets) {
                accounts
                    .patch(
                        service_account,
                        &PatchParams::default(),
                        &Patch::Merge(json!({ "imagePullSecrets": pull_secrets })),
                    )
                    .await
                    .with_context(|| {
                        format!("failed to update pull secrets of {service_account}")
                    })?;
                debug!(
                    "Service account {}/{} has {} pull secret(s)",
                    namespace,
                    service_account,
                    pull_secrets.len()
                );
            }
        }

        Ok(PodAdditions {
            pull_secrets,
            ..Default::default()
        })
    }
}
