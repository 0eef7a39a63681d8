//! # Container Materialization
//!
//! Turns the container components of a flattened template into pod
//! containers, and maps routing results back onto the template.

use crate::constants::{PROJECTS_ROOT, PROJECTS_VOLUME};
use crate::controller::reconciler::{FailureReason, ProvisionError};
use crate::crd::{ContainerComponent, DevWorkspaceTemplateSpec};
use crate::provision::{ExposedEndpoint, PodAdditions};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, ResourceRequirements, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

/// Endpoint attribute naming the endpoint's role; `main` marks the main URL
pub const ENDPOINT_TYPE_ATTRIBUTE: &str = "type";
pub const MAIN_ENDPOINT_TYPE: &str = "main";
/// Attribute written onto devfile endpoints once routing exposes them
pub const ENDPOINT_URL_ATTRIBUTE: &str = "controller.devfile.io/endpoint-url";

fn quantities(pairs: [(&str, &Option<String>); 2]) -> Result<BTreeMap<String, Quantity>, String> {
    let mut out = BTreeMap::new();
    for (key, value) in pairs {
        let Some(value) = value.as_deref().filter(|v| !v.is_empty()) else {
            continue;
        };
        if !value
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit() || c == '.')
        {
            return Err(format!("invalid {key} quantity '{value}'"));
        }
        out.insert(key.to_string(), Quantity(value.to_string()));
    }
    Ok(out)
}

fn resources(container: &ContainerComponent) -> Result<Option<ResourceRequirements>, String> {
    let limits = quantities([
        ("memory", &container.memory_limit),
        ("cpu", &container.cpu_limit),
    ])?;
    let requests = quantities([
        ("memory", &container.memory_request),
        ("cpu", &container.cpu_request),
    ])?;
    if limits.is_empty() && requests.is_empty() {
        return Ok(None);
    }
    Ok(Some(ResourceRequirements {
        limits: (!limits.is_empty()).then_some(limits),
        requests: (!requests.is_empty()).then_some(requests),
        ..Default::default()
    }))
}

fn container_for(name: &str, component: &ContainerComponent) -> Result<Container, String> {
    let mut volume_mounts: Vec<VolumeMount> = component
        .volume_mounts
        .iter()
        .map(|mount| VolumeMount {
            name: mount.name.clone(),
            mount_path: mount
                .path
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| format!("/{}", mount.name)),
            ..Default::default()
        })
        .collect();
    if component.mount_sources.unwrap_or(true) {
        volume_mounts.push(VolumeMount {
            name: PROJECTS_VOLUME.to_string(),
            mount_path: component
                .source_mapping
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| PROJECTS_ROOT.to_string()),
            ..Default::default()
        });
    }

    let ports: Vec<ContainerPort> = component
        .endpoints
        .iter()
        .map(|endpoint| ContainerPort {
            container_port: endpoint.target_port,
            name: Some(truncate_port_name(&endpoint.name)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    let env: Vec<EnvVar> = component
        .env
        .iter()
        .map(|var| EnvVar {
            name: var.name.clone(),
            value: Some(var.value.clone()),
            ..Default::default()
        })
        .collect();

    Ok(Container {
        name: name.to_string(),
        image: Some(component.image.clone()),
        command: (!component.command.is_empty()).then(|| component.command.clone()),
        args: (!component.args.is_empty()).then(|| component.args.clone()),
        env: (!env.is_empty()).then_some(env),
        volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
        ports: (!ports.is_empty()).then_some(ports),
        resources: resources(component)?,
        image_pull_policy: Some("IfNotPresent".to_string()),
        ..Default::default()
    })
}

/// Kubernetes port names are limited to 15 characters
fn truncate_port_name(name: &str) -> String {
    name.chars().take(15).collect()
}

/// Containers for every container component in the template
///
/// # Errors
///
/// `Fail(BadRequest)` when a component cannot be expressed as a container.
pub fn materialize(template: &DevWorkspaceTemplateSpec) -> Result<PodAdditions, ProvisionError> {
    let mut pod = PodAdditions::default();
    for component in &template.components {
        let Some(container) = &component.container else {
            continue;
        };
        let built = container_for(&component.name, container).map_err(|message| {
            ProvisionError::fail_with_reason(
                format!("component '{}': {message}", component.name),
                FailureReason::BadRequest,
            )
        })?;
        pod.containers.push(built);
    }
    Ok(pod)
}

/// URL of the first exposed endpoint whose type attribute is `main`
///
/// Components are visited in sorted order.
#[must_use]
pub fn main_url(exposed: &BTreeMap<String, Vec<ExposedEndpoint>>) -> String {
    exposed
        .values()
        .flatten()
        .find(|endpoint| {
            endpoint.attributes.get(ENDPOINT_TYPE_ATTRIBUTE).map(String::as_str)
                == Some(MAIN_ENDPOINT_TYPE)
        })
        .map(|endpoint| endpoint.url.clone())
        .unwrap_or_default()
}

/// Record exposed endpoint URLs as attributes on the matching devfile endpoints
pub fn annotate_endpoint_urls(
    template: &mut DevWorkspaceTemplateSpec,
    exposed: &BTreeMap<String, Vec<ExposedEndpoint>>,
) {
    for component in &mut template.components {
        let (Some(container), Some(endpoints)) =
            (component.container.as_mut(), exposed.get(&component.name))
        else {
            continue;
        };
        for endpoint in &mut container.endpoints {
            if let Some(found) = endpoints.iter().find(|e| e.name == endpoint.name) {
                endpoint
                    .attributes
                    .insert(ENDPOINT_URL_ATTRIBUTE.to_string(), found.url.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Component, Endpoint, VolumeMountDef};

    fn tooling() -> Component {
        Component {
            name: "tooling".to_string(),
            container: Some(ContainerComponent {
                image: "quay.io/devfile/udi:latest".to_string(),
                volume_mounts: vec![VolumeMountDef {
                    name: "m2".to_string(),
                    path: None,
                }],
                endpoints: vec![Endpoint {
                    name: "code-redirect-endpoint".to_string(),
                    target_port: 3100,
                    ..Default::default()
                }],
                memory_limit: Some("2Gi".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_materialize_container_component() {
        let template = DevWorkspaceTemplateSpec {
            components: vec![tooling()],
            ..Default::default()
        };
        let pod = materialize(&template).unwrap();
        assert_eq!(pod.containers.len(), 1);

        let container = &pod.containers[0];
        let mounts: Vec<(&str, &str)> = container
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| (m.name.as_str(), m.mount_path.as_str()))
            .collect();
        assert_eq!(mounts, vec![("m2", "/m2"), ("projects", "/projects")]);

        let port = &container.ports.as_ref().unwrap()[0];
        assert_eq!(port.container_port, 3100);
        assert_eq!(port.name.as_deref(), Some("code-redirect-e"), "port names are capped at 15 chars");

        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits.get("memory"), Some(&Quantity("2Gi".to_string())));
    }

    #[test]
    fn test_materialize_rejects_bad_quantity() {
        let mut component = tooling();
        if let Some(container) = component.container.as_mut() {
            container.cpu_limit = Some("lots".to_string());
        }
        let template = DevWorkspaceTemplateSpec {
            components: vec![component],
            ..Default::default()
        };
        assert!(matches!(
            materialize(&template),
            Err(ProvisionError::Fail {
                reason: Some(FailureReason::BadRequest),
                ..
            })
        ));
    }

    #[test]
    fn test_main_url_uses_first_main_endpoint_in_component_order() {
        let endpoint = |name: &str, url: &str, kind: Option<&str>| ExposedEndpoint {
            name: name.to_string(),
            url: url.to_string(),
            attributes: kind
                .map(|k| BTreeMap::from([(ENDPOINT_TYPE_ATTRIBUTE.to_string(), k.to_string())]))
                .unwrap_or_default(),
        };
        let exposed = BTreeMap::from([
            ("zeta".to_string(), vec![endpoint("z", "https://zeta/", Some("main"))]),
            (
                "alpha".to_string(),
                vec![
                    endpoint("a1", "https://alpha/api", None),
                    endpoint("a2", "https://alpha/", Some("main")),
                ],
            ),
        ]);
        assert_eq!(main_url(&exposed), "https://alpha/");
        assert_eq!(main_url(&BTreeMap::new()), "");
    }

    #[test]
    fn test_annotate_endpoint_urls() {
        let mut template = DevWorkspaceTemplateSpec {
            components: vec![tooling()],
            ..Default::default()
        };
        let exposed = BTreeMap::from([(
            "tooling".to_string(),
            vec![ExposedEndpoint {
                name: "code-redirect-endpoint".to_string(),
                url: "https://ws/code".to_string(),
                attributes: BTreeMap::new(),
            }],
        )]);
        annotate_endpoint_urls(&mut template, &exposed);
        let endpoint = &template.components[0].container.as_ref().unwrap().endpoints[0];
        assert_eq!(
            endpoint.attributes.get(ENDPOINT_URL_ATTRIBUTE).map(String::as_str),
            Some("https://ws/code")
        );
    }
}
