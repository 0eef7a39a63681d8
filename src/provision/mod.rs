//! # Provisioning
//!
//! Collaborator contracts consumed by the reconciliation engine, the pod
//! additions they contribute, and the pure template-to-pod helpers.
//!
//! ## Module Structure
//!
//! - `containers.rs` - Devfile components to containers, endpoint URLs, main URL
//! - `env.rs` - Common environment variables
//! - `projects.rs` - Project validation and the project-clone init container
//! - `home.rs` - Persistent home volume
//! - `tokens.rs` - Projected service account token volumes
//! - `metadata.rs` - Metadata ConfigMap describing original and flattened templates
//! - `basic/` - Kubernetes-backed collaborator implementations used by the binary
//!
//! Every collaborator reports failures as a
//! [`ProvisionError`](crate::controller::reconciler::ProvisionError). The
//! engine classifies them; collaborators never decide control flow.

pub mod basic;
pub mod containers;
pub mod env;
pub mod home;
pub mod metadata;
pub mod projects;
pub mod tokens;

use crate::controller::reconciler::{FailureReason, ProvisionError};
use crate::crd::{DevWorkspace, DevWorkspaceTemplateSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Container, LocalObjectReference, Volume};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Containers, volumes and metadata contributed by one provisioning step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodAdditions {
    pub containers: Vec<Container>,
    pub init_containers: Vec<Container>,
    pub volumes: Vec<Volume>,
    pub pull_secrets: Vec<LocalObjectReference>,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub service_account_annotations: BTreeMap<String, String>,
}

impl PodAdditions {
    /// Fold another step's additions into this one
    ///
    /// Volumes and pull secrets already present by name are skipped.
    pub fn merge(&mut self, other: PodAdditions) {
        self.containers.extend(other.containers);
        self.init_containers.extend(other.init_containers);
        for volume in other.volumes {
            if !self.has_volume(&volume.name) {
                self.volumes.push(volume);
            }
        }
        for secret in other.pull_secrets {
            if !self.pull_secrets.iter().any(|s| s.name == secret.name) {
                self.pull_secrets.push(secret);
            }
        }
        self.annotations.extend(other.annotations);
        self.labels.extend(other.labels);
        self.service_account_annotations
            .extend(other.service_account_annotations);
    }

    #[must_use]
    pub fn has_volume(&self, name: &str) -> bool {
        self.volumes.iter().any(|v| v.name == name)
    }

    /// All regular and init containers
    pub fn all_containers_mut(&mut self) -> impl Iterator<Item = &mut Container> {
        self.containers.iter_mut().chain(self.init_containers.iter_mut())
    }
}

/// Flattened template and any non-fatal findings from resolution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedTemplate {
    pub template: DevWorkspaceTemplateSpec,
    pub warnings: Vec<String>,
}

/// An endpoint exposed by the routing layer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExposedEndpoint {
    pub name: String,
    pub url: String,
    pub attributes: BTreeMap<String, String>,
}

/// Result of a routing sync
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingResult {
    pub pod_additions: Option<PodAdditions>,
    /// Exposed endpoints keyed by component name
    pub exposed_endpoints: BTreeMap<String, Vec<ExposedEndpoint>>,
    /// Optional progress message for the RoutingReady condition
    pub message: Option<String>,
}

/// Result of one health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub ready: bool,
    pub status_code: Option<u16>,
}

/// Resolves parents and plugins into one self-contained template
#[async_trait]
pub trait TemplateResolver: Send + Sync {
    async fn resolve(&self, workspace: &DevWorkspace) -> Result<ResolvedTemplate, ProvisionError>;

    /// Structural validation of the flattened components
    fn validate_components(&self, template: &DevWorkspaceTemplateSpec)
        -> Result<(), ProvisionError>;
}

/// One storage strategy
#[async_trait]
pub trait StorageProvisioner: Send + Sync {
    fn needs_storage(&self, template: &DevWorkspaceTemplateSpec) -> bool;

    /// Add volumes for the template to `pod` and make sure they exist
    async fn provision_storage(
        &self,
        pod: &mut PodAdditions,
        workspace: &DevWorkspace,
        template: &DevWorkspaceTemplateSpec,
    ) -> Result<(), ProvisionError>;

    /// Remove the workspace's data on deletion
    async fn cleanup_storage(&self, workspace: &DevWorkspace) -> Result<(), ProvisionError>;
}

/// Namespace RBAC for workspaces
#[async_trait]
pub trait AccessController: Send + Sync {
    async fn sync(&self, workspace: &DevWorkspace) -> Result<(), ProvisionError>;
    async fn finalize(&self, workspace: &DevWorkspace) -> Result<(), ProvisionError>;
}

/// Exposes workspace endpoints
#[async_trait]
pub trait RoutingSynchronizer: Send + Sync {
    /// Returns `Retry` until routing is ready
    async fn sync(
        &self,
        workspace: &DevWorkspace,
        template: &DevWorkspaceTemplateSpec,
    ) -> Result<RoutingResult, ProvisionError>;

    /// Take routing down while the workspace is stopped
    async fn suspend(&self, _workspace: &DevWorkspace) -> Result<(), ProvisionError> {
        Ok(())
    }
}

/// Workspace service account
#[async_trait]
pub trait IdentitySynchronizer: Send + Sync {
    /// Ensure the service account exists; returns its name
    async fn sync_service_account(
        &self,
        workspace: &DevWorkspace,
        annotations: &BTreeMap<String, String>,
    ) -> Result<String, ProvisionError>;

    /// Cleanup for workspaces still carrying the retired service account
    /// finalizer; `Ok(true)` asks for another pass
    async fn finalize_legacy(&self, workspace: &DevWorkspace) -> Result<bool, ProvisionError>;
}

/// Image pull secrets for the workload
#[async_trait]
pub trait PullSecretSynchronizer: Send + Sync {
    async fn sync(
        &self,
        workspace: &DevWorkspace,
        service_account: &str,
    ) -> Result<PodAdditions, ProvisionError>;
}

/// Secrets and ConfigMaps that users mark for mounting into every workspace
#[async_trait]
pub trait AutomountProvider: Send + Sync {
    /// Add volumes, mounts and env sources for the marked objects to `pod`
    async fn provision(
        &self,
        workspace: &DevWorkspace,
        pod: &mut PodAdditions,
    ) -> Result<(), ProvisionError>;
}

/// Cluster objects declared by kubernetes/openshift components
#[async_trait]
pub trait SubResourceSynchronizer: Send + Sync {
    async fn sync(
        &self,
        workspace: &DevWorkspace,
        template: &DevWorkspaceTemplateSpec,
    ) -> Result<(), ProvisionError>;
}

/// The workspace workload (deployment)
#[async_trait]
pub trait WorkloadSynchronizer: Send + Sync {
    /// Apply the workload; `Retry` until it is ready
    async fn sync(
        &self,
        workspace: &DevWorkspace,
        pod: &PodAdditions,
        service_account: &str,
    ) -> Result<(), ProvisionError>;

    /// Scale to zero; `Ok(true)` once no replicas remain
    async fn scale_to_zero(&self, workspace: &DevWorkspace) -> Result<bool, ProvisionError>;

    /// Delete the workload; `Ok(true)` while deletion is still in progress
    async fn delete(&self, workspace: &DevWorkspace) -> Result<bool, ProvisionError>;
}

/// Checks the workspace's main endpoint
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, main_url: &str) -> Result<ProbeResult, ProvisionError>;
}

/// Lifecycle metric events
pub trait MetricsSink: Send + Sync {
    fn started(&self, workspace: &DevWorkspace);
    /// `startup` is the time from the Started condition to Running, when known
    fn running(&self, workspace: &DevWorkspace, startup: Option<Duration>);
    fn failed(&self, workspace: &DevWorkspace, reason: FailureReason);
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Storage strategies keyed by storage type
#[derive(Clone, Default)]
pub struct StorageRegistry {
    provisioners: HashMap<String, Arc<dyn StorageProvisioner>>,
}

impl std::fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.provisioners.keys().collect();
        types.sort();
        f.debug_struct("StorageRegistry").field("types", &types).finish()
    }
}

impl StorageRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, storage_type: &str, provisioner: Arc<dyn StorageProvisioner>) -> Self {
        self.provisioners
            .insert(storage_type.to_string(), provisioner);
        self
    }

    /// Provisioner for the template's storage type, falling back to `default_type`
    ///
    /// # Errors
    ///
    /// `Fail(BadRequest)` for a storage type nothing is registered for.
    pub fn for_template(
        &self,
        template: &DevWorkspaceTemplateSpec,
        default_type: &str,
    ) -> Result<Arc<dyn StorageProvisioner>, ProvisionError> {
        let storage_type = template
            .attribute(crate::constants::DEVWORKSPACE_STORAGE_TYPE_ATTRIBUTE)
            .unwrap_or(default_type);
        self.provisioners
            .get(storage_type)
            .cloned()
            .ok_or_else(|| {
                ProvisionError::fail_with_reason(
                    format!("unsupported storage type '{storage_type}'"),
                    FailureReason::BadRequest,
                )
            })
    }
}

/// Every collaborator the engine calls, constructed once at startup
#[derive(Clone)]
pub struct Provisioners {
    pub resolver: Arc<dyn TemplateResolver>,
    pub storage: StorageRegistry,
    pub access: Arc<dyn AccessController>,
    pub routing: Arc<dyn RoutingSynchronizer>,
    pub identity: Arc<dyn IdentitySynchronizer>,
    pub pull_secrets: Arc<dyn PullSecretSynchronizer>,
    pub automount: Arc<dyn AutomountProvider>,
    pub sub_resources: Arc<dyn SubResourceSynchronizer>,
    pub workload: Arc<dyn WorkloadSynchronizer>,
    pub health: Arc<dyn HealthProbe>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for Provisioners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioners")
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEVWORKSPACE_STORAGE_TYPE_ATTRIBUTE;

    struct NoStorage;

    #[async_trait]
    impl StorageProvisioner for NoStorage {
        fn needs_storage(&self, _template: &DevWorkspaceTemplateSpec) -> bool {
            false
        }
        async fn provision_storage(
            &self,
            _pod: &mut PodAdditions,
            _workspace: &DevWorkspace,
            _template: &DevWorkspaceTemplateSpec,
        ) -> Result<(), ProvisionError> {
            Ok(())
        }
        async fn cleanup_storage(&self, _workspace: &DevWorkspace) -> Result<(), ProvisionError> {
            Ok(())
        }
    }

    #[test]
    fn test_storage_registry_lookup() {
        let registry = StorageRegistry::new().with("ephemeral", Arc::new(NoStorage));

        let mut template = DevWorkspaceTemplateSpec::default();
        assert!(registry.for_template(&template, "ephemeral").is_ok());
        assert!(registry.for_template(&template, "per-user").is_err());

        template.attributes.insert(
            DEVWORKSPACE_STORAGE_TYPE_ATTRIBUTE.to_string(),
            "bogus".to_string(),
        );
        match registry.for_template(&template, "ephemeral") {
            Err(ProvisionError::Fail { message, reason }) => {
                assert_eq!(message, "unsupported storage type 'bogus'");
                assert_eq!(reason, Some(FailureReason::BadRequest));
            }
            _ => panic!("unknown storage type must fail"),
        }
    }

    #[test]
    fn test_pod_additions_merge_dedupes_volumes() {
        let volume = |name: &str| Volume {
            name: name.to_string(),
            ..Default::default()
        };
        let mut pod = PodAdditions {
            volumes: vec![volume("projects")],
            ..Default::default()
        };
        pod.merge(PodAdditions {
            volumes: vec![volume("projects"), volume("metadata")],
            pull_secrets: vec![LocalObjectReference {
                name: "registry".to_string(),
            }],
            ..Default::default()
        });
        let names: Vec<&str> = pod.volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["projects", "metadata"]);
        assert_eq!(pod.pull_secrets.len(), 1);
    }
}
