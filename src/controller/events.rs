//! # Event Filtering
//!
//! Decides which watch events are worth a reconcile pass, and which
//! workspaces a related object maps to.
//!
//! - Workspaces: every first sighting and every deletion triggers. A
//!   workspace in the Failed phase only triggers when `spec.started` changed,
//!   so a failed workspace is not re-provisioned on every status write.
//! - Pods: mapped through the workspace name and id labels, and only when
//!   the state of a container changed.
//! - PVCs: per-workspace claims map to their owner; shared claims map to
//!   every started workspace in the namespace using shared storage.
//! - Automount Secrets and ConfigMaps: any event from the labelled watch
//!   maps to every started workspace in the namespace.
//!
//! The filter only remembers failed workspaces and the last pod of each
//! workspace. Entries go when the object is deleted or stops qualifying.

use crate::constants::{
    COMMON_STORAGE_TYPE, DEVWORKSPACE_ID_LABEL, DEVWORKSPACE_NAME_LABEL,
    DEVWORKSPACE_PVC_TYPE_LABEL, DEVWORKSPACE_STORAGE_TYPE_ATTRIBUTE, PER_USER_STORAGE_TYPE,
    PER_WORKSPACE_STORAGE_TYPE,
};
use crate::crd::{DevWorkspace, Phase};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use kube_runtime::reflector::ObjectRef;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Per-container state that matters to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSnapshot {
    pub name: String,
    pub ready: bool,
    pub restart_count: i32,
    pub waiting: Option<String>,
    pub terminated: Option<String>,
}

/// Last pod seen for a workspace
#[derive(Debug, Clone, PartialEq, Eq)]
struct PodSighting {
    pod: String,
    containers: Vec<ContainerSnapshot>,
}

/// Last-seen state of watched objects, keyed by workspace `namespace/name`
#[derive(Debug, Default)]
pub struct EventFilter {
    /// `spec.started` of workspaces last seen in the Failed phase
    failed: Mutex<HashMap<String, bool>>,
    pods: Mutex<HashMap<String, PodSighting>>,
}

fn workspace_key(target: &ObjectRef<DevWorkspace>) -> String {
    format!(
        "{}/{}",
        target.namespace.as_deref().unwrap_or("default"),
        target.name
    )
}

/// Container states of a pod, init containers first
#[must_use]
pub fn container_snapshots(pod: &Pod) -> Vec<ContainerSnapshot> {
    pod.status
        .iter()
        .flat_map(|s| {
            s.init_container_statuses
                .iter()
                .flatten()
                .chain(s.container_statuses.iter().flatten())
        })
        .map(|c| {
            let state = c.state.as_ref();
            ContainerSnapshot {
                name: c.name.clone(),
                ready: c.ready,
                restart_count: c.restart_count,
                waiting: state
                    .and_then(|s| s.waiting.as_ref())
                    .and_then(|w| w.reason.clone()),
                terminated: state
                    .and_then(|s| s.terminated.as_ref())
                    .and_then(|t| t.reason.clone()),
            }
        })
        .collect()
}

/// Workspace a pod belongs to, from its labels
#[must_use]
pub fn pod_workspace(pod: &Pod) -> Option<ObjectRef<DevWorkspace>> {
    let labels = pod.metadata.labels.as_ref()?;
    labels.get(DEVWORKSPACE_ID_LABEL)?;
    let name = labels.get(DEVWORKSPACE_NAME_LABEL)?;
    Some(ObjectRef::new(name).within(pod.metadata.namespace.as_deref()?))
}

fn started_in_namespace<'a>(
    workspaces: &'a [Arc<DevWorkspace>],
    namespace: &'a str,
) -> impl Iterator<Item = &'a DevWorkspace> {
    workspaces
        .iter()
        .map(AsRef::as_ref)
        .filter(move |ws| ws.spec.started && ws.metadata.namespace.as_deref() == Some(namespace))
}

/// Workspaces affected by a change to `pvc`
#[must_use]
pub fn pvc_targets(
    pvc: &PersistentVolumeClaim,
    workspaces: &[Arc<DevWorkspace>],
) -> Vec<ObjectRef<DevWorkspace>> {
    let Some(namespace) = pvc.metadata.namespace.as_deref() else {
        return Vec::new();
    };
    let pvc_type = pvc
        .labels()
        .get(DEVWORKSPACE_PVC_TYPE_LABEL)
        .map_or("", String::as_str);

    if pvc_type == PER_WORKSPACE_STORAGE_TYPE {
        return pvc
            .owner_references()
            .iter()
            .filter(|owner| owner.kind == DevWorkspace::kind(&()))
            .map(|owner| ObjectRef::new(&owner.name).within(namespace))
            .collect();
    }
    if !matches!(pvc_type, "" | COMMON_STORAGE_TYPE | PER_USER_STORAGE_TYPE) {
        return Vec::new();
    }

    started_in_namespace(workspaces, namespace)
        .filter(|ws| {
            matches!(
                ws.spec
                    .template
                    .attribute(DEVWORKSPACE_STORAGE_TYPE_ATTRIBUTE)
                    .unwrap_or_default(),
                "" | COMMON_STORAGE_TYPE | PER_USER_STORAGE_TYPE
            )
        })
        .map(ObjectRef::from_obj)
        .collect()
}

/// Workspaces to reconcile for an automount Secret or ConfigMap event
///
/// The watch is label-selected, so it only delivers creations, changes,
/// deletions and label removals of mounted objects. Each of those changes
/// what started workspaces in the namespace mount.
#[must_use]
pub fn automount_targets(
    meta: &ObjectMeta,
    workspaces: &[Arc<DevWorkspace>],
) -> Vec<ObjectRef<DevWorkspace>> {
    let Some(namespace) = meta.namespace.as_deref() else {
        return Vec::new();
    };
    started_in_namespace(workspaces, namespace)
        .map(ObjectRef::from_obj)
        .collect()
}

impl EventFilter {
    /// Whether a workspace event should start a pass
    pub fn workspace_should_reconcile(&self, workspace: &DevWorkspace) -> bool {
        let key = workspace.key();
        let Ok(mut failed) = self.failed.lock() else {
            return true;
        };
        let phase = workspace.status.as_ref().and_then(|s| s.phase);
        if workspace.metadata.deletion_timestamp.is_some() {
            failed.remove(&key);
            if let Ok(mut pods) = self.pods.lock() {
                pods.remove(&key);
            }
            return true;
        }
        if phase != Some(Phase::Failed) {
            failed.remove(&key);
            return true;
        }
        let started = workspace.spec.started;
        failed.insert(key, started) != Some(started)
    }

    /// Workspace to reconcile for a pod event, if its containers changed
    pub fn pod_event(&self, pod: &Pod) -> Option<ObjectRef<DevWorkspace>> {
        let target = pod_workspace(pod)?;
        let Ok(mut pods) = self.pods.lock() else {
            return Some(target);
        };
        let key = workspace_key(&target);
        let pod_name = pod.name_any();
        if pod.metadata.deletion_timestamp.is_some() {
            if pods.get(&key).is_some_and(|seen| seen.pod == pod_name) {
                pods.remove(&key);
            }
            return Some(target);
        }
        let sighting = PodSighting {
            pod: pod_name,
            containers: container_snapshots(pod),
        };
        let changed = pods.get(&key) != Some(&sighting);
        if changed {
            pods.insert(key, sighting);
        }
        changed.then_some(target)
    }

    /// Number of workspaces the filter holds state for
    #[must_use]
    pub fn tracked(&self) -> usize {
        let failed = self.failed.lock().map_or(0, |t| t.len());
        let pods = self.pods.lock().map_or(0, |t| t.len());
        failed + pods
    }
}
