//! # Basic Routing
//!
//! Exposes workspace endpoints through a single in-cluster Service. URLs are
//! service DNS names, reachable from inside the cluster only.

use crate::controller::reconciler::ProvisionError;
use crate::crd::{DevWorkspace, DevWorkspaceTemplateSpec, Endpoint};
use crate::provision::basic::{apply, is_status, namespace_of, owned_by, workspace_labels};
use crate::provision::{ExposedEndpoint, RoutingResult, RoutingSynchronizer};
use crate::constants::DEVWORKSPACE_ID_LABEL;
use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::info;

const EXPOSURE_NONE: &str = "none";

#[must_use]
pub fn service_name(workspace_id: &str) -> String {
    format!("{workspace_id}-service")
}

fn exposed(endpoint: &Endpoint) -> bool {
    endpoint.exposure.as_deref() != Some(EXPOSURE_NONE)
}

fn endpoint_url(endpoint: &Endpoint, host: &str) -> String {
    let scheme = match (endpoint.protocol.as_deref(), endpoint.secure.unwrap_or(false)) {
        (Some("ws"), false) => "ws",
        (Some("ws" | "wss"), _) => "wss",
        (_, true) => "https",
        _ => "http",
    };
    let path = endpoint
        .path
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(|p| {
            if p.starts_with('/') {
                p.to_string()
            } else {
                format!("/{p}")
            }
        })
        .unwrap_or_default();
    format!("{scheme}://{host}:{}{path}", endpoint.target_port)
}

/// Endpoints exposed by the Service, keyed by component name
fn exposed_endpoints(
    template: &DevWorkspaceTemplateSpec,
    host: &str,
) -> BTreeMap<String, Vec<ExposedEndpoint>> {
    let mut out: BTreeMap<String, Vec<ExposedEndpoint>> = BTreeMap::new();
    for component in &template.components {
        let Some(container) = &component.container else {
            continue;
        };
        let endpoints: Vec<ExposedEndpoint> = container
            .endpoints
            .iter()
            .filter(|e| exposed(e))
            .map(|e| ExposedEndpoint {
                name: e.name.clone(),
                url: endpoint_url(e, host),
                attributes: e.attributes.clone(),
            })
            .collect();
        if !endpoints.is_empty() {
            out.insert(component.name.clone(), endpoints);
        }
    }
    out
}

fn service_ports(template: &DevWorkspaceTemplateSpec) -> Vec<ServicePort> {
    let mut ports: Vec<ServicePort> = Vec::new();
    for endpoint in template
        .components
        .iter()
        .filter_map(|c| c.container.as_ref())
        .flat_map(|c| &c.endpoints)
        .filter(|e| exposed(e))
    {
        if ports.iter().any(|p| p.port == endpoint.target_port) {
            continue;
        }
        ports.push(ServicePort {
            name: Some(endpoint.name.chars().take(15).collect()),
            port: endpoint.target_port,
            target_port: Some(IntOrString::Int(endpoint.target_port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }
    ports
}

/// Routing through a ClusterIP Service named `<id>-service`
#[derive(Clone)]
pub struct BasicRouting {
    client: Client,
}

impl std::fmt::Debug for BasicRouting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicRouting").finish_non_exhaustive()
    }
}

impl BasicRouting {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RoutingSynchronizer for BasicRouting {
    async fn sync(
        &self,
        workspace: &DevWorkspace,
        template: &DevWorkspaceTemplateSpec,
    ) -> Result<RoutingResult, ProvisionError> {
        let ports = service_ports(template);
        if ports.is_empty() {
            return Ok(RoutingResult::default());
        }

        let namespace = namespace_of(workspace)?;
        let workspace_id = workspace.workspace_id();
        let name = service_name(workspace_id);
        let service = Service {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(workspace_labels(workspace)),
                owner_references: owned_by(workspace),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([(
                    DEVWORKSPACE_ID_LABEL.to_string(),
                    workspace_id.to_string(),
                )])),
                ports: Some(ports),
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        apply(&api, &name, &service).await?;

        let host = format!("{name}.{namespace}.svc");
        Ok(RoutingResult {
            pod_additions: None,
            exposed_endpoints: exposed_endpoints(template, &host),
            message: None,
        })
    }

    async fn suspend(&self, workspace: &DevWorkspace) -> Result<(), ProvisionError> {
        let namespace = namespace_of(workspace)?;
        let name = service_name(workspace.workspace_id());
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        match api.delete(&name, &DeleteParams::background()).await {
            Ok(_) => {
                info!("🔌 Removed workspace service {}/{}", namespace, name);
                Ok(())
            }
            Err(err) if is_status(&err, 404) => Ok(()),
            Err(err) => Err(anyhow::Error::new(err))
                .with_context(|| format!("failed to delete service {name}"))
                .map_err(ProvisionError::from),
        }
    }
}
