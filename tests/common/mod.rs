//! Common test utilities for reconciliation tests
//!
//! An in-memory [`WorkspaceStore`] that enforces resource versions the way
//! the API server does, scripted fakes for every collaborator, a fixed clock,
//! and a [`Harness`] that wires them into a [`Reconciler`].

#![allow(dead_code, reason = "each test binary uses a different subset")]

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use devworkspace_controller::cluster::{ObjectKind, OwnedObject, StoreError, WorkspaceStore};
use devworkspace_controller::config::WorkspaceConfig;
use devworkspace_controller::constants::{
    COMMON_STORAGE_TYPE, EPHEMERAL_STORAGE_TYPE, PER_USER_STORAGE_TYPE, PER_WORKSPACE_STORAGE_TYPE,
};
use devworkspace_controller::controller::reconciler::{
    FailureReason, ProvisionError, ReconcileResult, Reconciler, ReconcilerError,
};
use devworkspace_controller::crd::{
    Component, ContainerComponent, DevWorkspace, DevWorkspaceSpec, DevWorkspaceStatus,
    DevWorkspaceTemplateSpec,
};
use devworkspace_controller::provision::{
    AccessController, AutomountProvider, Clock, ExposedEndpoint, HealthProbe,
    IdentitySynchronizer, MetricsSink, PodAdditions, ProbeResult, Provisioners,
    PullSecretSynchronizer, ResolvedTemplate, RoutingResult, RoutingSynchronizer,
    StorageProvisioner, StorageRegistry, SubResourceSynchronizer, TemplateResolver,
    WorkloadSynchronizer,
};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

pub const NAMESPACE: &str = "user-ns";

/// Upper bound on passes in [`Harness::converge`]
pub const MAX_PASSES: usize = 20;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    workspaces: BTreeMap<(String, String), DevWorkspace>,
    owned: Vec<OwnedObject>,
    config_maps: BTreeMap<(String, String), ConfigMap>,
    terminating: BTreeSet<String>,
    version: u64,
    status_writes: usize,
}

impl StoreState {
    fn bump(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    /// Stored copy of `workspace`, if its resource version is current
    fn current(&mut self, workspace: &DevWorkspace) -> Result<&mut DevWorkspace, StoreError> {
        let key = object_key(workspace);
        let stored = self
            .workspaces
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(workspace.key()))?;
        if stored.metadata.resource_version != workspace.metadata.resource_version {
            return Err(StoreError::Conflict(workspace.key()));
        }
        Ok(stored)
    }
}

fn object_key(workspace: &DevWorkspace) -> (String, String) {
    (
        workspace.metadata.namespace.clone().unwrap_or_default(),
        workspace.metadata.name.clone().unwrap_or_default(),
    )
}

/// In-memory API server for DevWorkspaces and the objects they own
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    /// Make `list_workspaces` fail, as an unreachable API server would
    pub list_broken: AtomicBool,
}

impl MemoryStore {
    pub fn insert(&self, mut workspace: DevWorkspace) {
        let mut state = self.state.lock().unwrap();
        workspace.metadata.resource_version = Some(state.bump());
        state.workspaces.insert(object_key(&workspace), workspace);
    }

    pub fn get(&self, name: &str) -> DevWorkspace {
        self.try_get(name)
            .unwrap_or_else(|| panic!("workspace {name} should exist"))
    }

    pub fn try_get(&self, name: &str) -> Option<DevWorkspace> {
        self.state
            .lock()
            .unwrap()
            .workspaces
            .get(&(NAMESPACE.to_string(), name.to_string()))
            .cloned()
    }

    pub fn status(&self, name: &str) -> DevWorkspaceStatus {
        self.get(name).status.unwrap_or_default()
    }

    /// Apply a user edit, as `kubectl edit` would
    pub fn edit(&self, name: &str, change: impl FnOnce(&mut DevWorkspace)) {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        let workspace = state
            .workspaces
            .get_mut(&(NAMESPACE.to_string(), name.to_string()))
            .unwrap_or_else(|| panic!("workspace {name} should exist"));
        change(workspace);
        workspace.metadata.resource_version = Some(version);
    }

    /// Mark for deletion; the object goes away once its finalizers are gone
    pub fn delete(&self, name: &str, now: DateTime<Utc>) {
        let timestamp: Time =
            serde_json::from_value(serde_json::json!(now.to_rfc3339_opts(SecondsFormat::Secs, true)))
                .unwrap();
        self.edit(name, |ws| ws.metadata.deletion_timestamp = Some(timestamp));
    }

    pub fn add_owned(&self, object: OwnedObject) {
        self.state.lock().unwrap().owned.push(object);
    }

    pub fn owned(&self) -> Vec<OwnedObject> {
        self.state.lock().unwrap().owned.clone()
    }

    pub fn set_terminating(&self, namespace: &str) {
        self.state
            .lock()
            .unwrap()
            .terminating
            .insert(namespace.to_string());
    }

    pub fn config_map(&self, name: &str) -> Option<ConfigMap> {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .get(&(NAMESPACE.to_string(), name.to_string()))
            .cloned()
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }
}

#[async_trait]
impl WorkspaceStore for MemoryStore {
    async fn get_workspace(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DevWorkspace>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .workspaces
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_workspaces(&self, namespace: &str) -> Result<Vec<DevWorkspace>, StoreError> {
        if self.list_broken.load(Ordering::SeqCst) {
            let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
            return Err(StoreError::Encode(err));
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .workspaces
            .values()
            .filter(|ws| ws.metadata.namespace.as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn replace_status(
        &self,
        workspace: &DevWorkspace,
        status: &DevWorkspaceStatus,
    ) -> Result<DevWorkspace, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.current(workspace)?;
        let version = state.bump();
        state.status_writes += 1;
        let stored = state
            .workspaces
            .get_mut(&object_key(workspace))
            .ok_or_else(|| StoreError::NotFound(workspace.key()))?;
        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }

    async fn set_finalizers(
        &self,
        workspace: &DevWorkspace,
        finalizers: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.current(workspace)?;
        let version = state.bump();
        let key = object_key(workspace);
        let stored = state
            .workspaces
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(workspace.key()))?;
        stored.metadata.finalizers = Some(finalizers.to_vec());
        stored.metadata.resource_version = Some(version);
        if finalizers.is_empty() && stored.metadata.deletion_timestamp.is_some() {
            state.workspaces.remove(&key);
        }
        Ok(())
    }

    async fn set_started(
        &self,
        workspace: &DevWorkspace,
        started: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.current(workspace)?;
        let version = state.bump();
        let stored = state
            .workspaces
            .get_mut(&object_key(workspace))
            .ok_or_else(|| StoreError::NotFound(workspace.key()))?;
        stored.spec.started = started;
        stored.metadata.resource_version = Some(version);
        Ok(())
    }

    async fn remove_annotation(
        &self,
        workspace: &DevWorkspace,
        key: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.current(workspace)?;
        let version = state.bump();
        let stored = state
            .workspaces
            .get_mut(&object_key(workspace))
            .ok_or_else(|| StoreError::NotFound(workspace.key()))?;
        if let Some(annotations) = stored.metadata.annotations.as_mut() {
            annotations.remove(key);
        }
        stored.metadata.resource_version = Some(version);
        Ok(())
    }

    async fn namespace_terminating(&self, namespace: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().unwrap().terminating.contains(namespace))
    }

    async fn list_owned_objects(
        &self,
        namespace: &str,
        _workspace_id: &str,
    ) -> Result<Vec<OwnedObject>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .owned
            .iter()
            .filter(|o| o.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn delete_object(&self, object: &OwnedObject) -> Result<(), StoreError> {
        self.state
            .lock()
            .unwrap()
            .owned
            .retain(|o| !(o.kind == object.kind && o.name == object.name));
        Ok(())
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), StoreError> {
        let key = (
            config_map.metadata.namespace.clone().unwrap_or_default(),
            config_map.metadata.name.clone().unwrap_or_default(),
        );
        self.state
            .lock()
            .unwrap()
            .config_maps
            .insert(key, config_map.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Returns the workspace's own template
#[derive(Debug, Default)]
pub struct FakeResolver;

#[async_trait]
impl TemplateResolver for FakeResolver {
    async fn resolve(&self, workspace: &DevWorkspace) -> Result<ResolvedTemplate, ProvisionError> {
        Ok(ResolvedTemplate {
            template: workspace.spec.template.clone(),
            warnings: Vec::new(),
        })
    }

    fn validate_components(
        &self,
        _template: &DevWorkspaceTemplateSpec,
    ) -> Result<(), ProvisionError> {
        Ok(())
    }
}

/// Storage that always needs a volume; cleanup can be scripted to fail
#[derive(Debug, Default)]
pub struct FakeStorage {
    pub cleanup_failure: Mutex<Option<String>>,
    pub cleanups: AtomicUsize,
}

#[async_trait]
impl StorageProvisioner for FakeStorage {
    fn needs_storage(&self, _template: &DevWorkspaceTemplateSpec) -> bool {
        true
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
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        match self.cleanup_failure.lock().unwrap().clone() {
            Some(message) => Err(ProvisionError::fail(message)),
            None => Ok(()),
        }
    }
}

/// Access control whose cleanup can be scripted to fail
#[derive(Debug, Default)]
pub struct FakeAccess {
    pub finalize_failure: Mutex<Option<String>>,
}

#[async_trait]
impl AccessController for FakeAccess {
    async fn sync(&self, _workspace: &DevWorkspace) -> Result<(), ProvisionError> {
        Ok(())
    }

    async fn finalize(&self, _workspace: &DevWorkspace) -> Result<(), ProvisionError> {
        match self.finalize_failure.lock().unwrap().clone() {
            Some(message) => Err(ProvisionError::fail(message)),
            None => Ok(()),
        }
    }
}

/// Routing that exposes one `main` endpoint when a URL is set
#[derive(Debug, Default)]
pub struct FakeRouting {
    pub main_url: Mutex<Option<String>>,
    pub suspended: AtomicUsize,
}

#[async_trait]
impl RoutingSynchronizer for FakeRouting {
    async fn sync(
        &self,
        _workspace: &DevWorkspace,
        _template: &DevWorkspaceTemplateSpec,
    ) -> Result<RoutingResult, ProvisionError> {
        let mut result = RoutingResult::default();
        if let Some(url) = self.main_url.lock().unwrap().clone() {
            result.exposed_endpoints.insert(
                "tooling".to_string(),
                vec![ExposedEndpoint {
                    name: "ide".to_string(),
                    url,
                    attributes: BTreeMap::from([("type".to_string(), "main".to_string())]),
                }],
            );
        }
        Ok(result)
    }

    async fn suspend(&self, _workspace: &DevWorkspace) -> Result<(), ProvisionError> {
        self.suspended.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeIdentity;

#[async_trait]
impl IdentitySynchronizer for FakeIdentity {
    async fn sync_service_account(
        &self,
        workspace: &DevWorkspace,
        _annotations: &BTreeMap<String, String>,
    ) -> Result<String, ProvisionError> {
        Ok(format!("{}-sa", workspace.workspace_id()))
    }

    async fn finalize_legacy(&self, _workspace: &DevWorkspace) -> Result<bool, ProvisionError> {
        Ok(false)
    }
}

#[derive(Debug, Default)]
pub struct FakePullSecrets;

#[async_trait]
impl PullSecretSynchronizer for FakePullSecrets {
    async fn sync(
        &self,
        _workspace: &DevWorkspace,
        _service_account: &str,
    ) -> Result<PodAdditions, ProvisionError> {
        Ok(PodAdditions::default())
    }
}

/// Automount that can be scripted to warn
#[derive(Debug, Default)]
pub struct FakeAutomount {
    pub warning: Mutex<Option<String>>,
}

#[async_trait]
impl AutomountProvider for FakeAutomount {
    async fn provision(
        &self,
        _workspace: &DevWorkspace,
        _pod: &mut PodAdditions,
    ) -> Result<(), ProvisionError> {
        match self.warning.lock().unwrap().clone() {
            Some(message) => Err(ProvisionError::warning(message)),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeSubResources;

#[async_trait]
impl SubResourceSynchronizer for FakeSubResources {
    async fn sync(
        &self,
        _workspace: &DevWorkspace,
        _template: &DevWorkspaceTemplateSpec,
    ) -> Result<(), ProvisionError> {
        Ok(())
    }
}

/// What the fake workload reports on sync
#[derive(Debug, Clone, Default)]
pub enum WorkloadScript {
    #[default]
    Ready,
    /// `Retry` with this message
    Progressing(String),
    /// `Fail(WorkspaceEngineFailure)` with this message
    Crashing(String),
    /// An unclassified error with this message
    Broken(String),
}

#[derive(Debug, Default)]
pub struct FakeWorkload {
    pub script: Mutex<WorkloadScript>,
    pub syncs: AtomicUsize,
    pub scaled_down: AtomicUsize,
    /// Deletions that report the workload as still going away
    pub pending_deletes: AtomicUsize,
}

#[async_trait]
impl WorkloadSynchronizer for FakeWorkload {
    async fn sync(
        &self,
        _workspace: &DevWorkspace,
        _pod: &PodAdditions,
        _service_account: &str,
    ) -> Result<(), ProvisionError> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().clone() {
            WorkloadScript::Ready => Ok(()),
            WorkloadScript::Progressing(message) => {
                Err(ProvisionError::retry(message, Duration::from_secs(5)))
            }
            WorkloadScript::Crashing(message) => Err(ProvisionError::fail_with_reason(
                message,
                FailureReason::WorkspaceEngineFailure,
            )),
            WorkloadScript::Broken(message) => Err(ProvisionError::Other(anyhow::anyhow!(message))),
        }
    }

    async fn scale_to_zero(&self, _workspace: &DevWorkspace) -> Result<bool, ProvisionError> {
        self.scaled_down.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn delete(&self, _workspace: &DevWorkspace) -> Result<bool, ProvisionError> {
        let pending = self
            .pending_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(pending)
    }
}

#[derive(Debug)]
pub struct FakeHealth {
    pub ready: AtomicBool,
    pub checks: AtomicUsize,
}

impl Default for FakeHealth {
    fn default() -> Self {
        Self {
            ready: AtomicBool::new(true),
            checks: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl HealthProbe for FakeHealth {
    async fn check(&self, _main_url: &str) -> Result<ProbeResult, ProvisionError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let ready = self.ready.load(Ordering::SeqCst);
        Ok(ProbeResult {
            ready,
            status_code: Some(if ready { 200 } else { 502 }),
        })
    }
}

/// Records lifecycle metric events as `event:name[:detail]`
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    pub events: Mutex<Vec<String>>,
}

impl RecordingMetrics {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl MetricsSink for RecordingMetrics {
    fn started(&self, workspace: &DevWorkspace) {
        self.events
            .lock()
            .unwrap()
            .push(format!("started:{}", workspace.metadata.name.as_deref().unwrap_or_default()));
    }

    fn running(&self, workspace: &DevWorkspace, _startup: Option<Duration>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("running:{}", workspace.metadata.name.as_deref().unwrap_or_default()));
    }

    fn failed(&self, workspace: &DevWorkspace, reason: FailureReason) {
        self.events.lock().unwrap().push(format!(
            "failed:{}:{}",
            workspace.metadata.name.as_deref().unwrap_or_default(),
            reason
        ));
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for FixedClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
        }
    }
}

impl FixedClock {
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap();
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Template with a single container component
pub fn template() -> DevWorkspaceTemplateSpec {
    DevWorkspaceTemplateSpec {
        components: vec![Component {
            name: "tooling".to_string(),
            container: Some(ContainerComponent {
                image: "quay.io/devfile/universal-developer-image:latest".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// A started workspace in [`NAMESPACE`] with no status yet
pub fn workspace(name: &str, uid: &str) -> DevWorkspace {
    let mut ws = DevWorkspace::new(
        name,
        DevWorkspaceSpec {
            started: true,
            template: template(),
            ..Default::default()
        },
    );
    ws.metadata.namespace = Some(NAMESPACE.to_string());
    ws.metadata.uid = Some(uid.to_string());
    ws
}

pub fn owner(uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: "workspace.devfile.io/v1alpha2".to_string(),
        kind: "DevWorkspace".to_string(),
        name: "owner".to_string(),
        uid: uid.to_string(),
        controller: Some(true),
        ..Default::default()
    }
}

pub fn owned_object(kind: ObjectKind, name: &str, owners: Vec<OwnerReference>) -> OwnedObject {
    OwnedObject {
        kind,
        namespace: NAMESPACE.to_string(),
        name: name.to_string(),
        owner_references: owners,
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub storage: Arc<FakeStorage>,
    pub access: Arc<FakeAccess>,
    pub automount: Arc<FakeAutomount>,
    pub routing: Arc<FakeRouting>,
    pub workload: Arc<FakeWorkload>,
    pub health: Arc<FakeHealth>,
    pub metrics: Arc<RecordingMetrics>,
    pub clock: Arc<FixedClock>,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(WorkspaceConfig::default())
    }

    pub fn with_config(config: WorkspaceConfig) -> Self {
        let store = Arc::new(MemoryStore::default());
        let storage = Arc::new(FakeStorage::default());
        let access = Arc::new(FakeAccess::default());
        let automount = Arc::new(FakeAutomount::default());
        let routing = Arc::new(FakeRouting::default());
        let workload = Arc::new(FakeWorkload::default());
        let health = Arc::new(FakeHealth::default());
        let metrics = Arc::new(RecordingMetrics::default());
        let clock = Arc::new(FixedClock::default());

        let storage_registry = [
            PER_USER_STORAGE_TYPE,
            COMMON_STORAGE_TYPE,
            PER_WORKSPACE_STORAGE_TYPE,
            EPHEMERAL_STORAGE_TYPE,
        ]
        .into_iter()
        .fold(StorageRegistry::new(), |registry, storage_type| {
            registry.with(storage_type, Arc::clone(&storage) as Arc<dyn StorageProvisioner>)
        });

        let provisioners = Provisioners {
            resolver: Arc::new(FakeResolver),
            storage: storage_registry,
            access: Arc::clone(&access) as Arc<dyn AccessController>,
            routing: Arc::clone(&routing) as Arc<dyn RoutingSynchronizer>,
            identity: Arc::new(FakeIdentity),
            pull_secrets: Arc::new(FakePullSecrets),
            automount: Arc::clone(&automount) as Arc<dyn AutomountProvider>,
            sub_resources: Arc::new(FakeSubResources),
            workload: Arc::clone(&workload) as Arc<dyn WorkloadSynchronizer>,
            health: Arc::clone(&health) as Arc<dyn HealthProbe>,
            metrics: Arc::clone(&metrics) as Arc<dyn MetricsSink>,
        };

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store) as Arc<dyn WorkspaceStore>,
            provisioners,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::new(RwLock::new(config)),
        ));

        Self {
            store,
            storage,
            access,
            automount,
            routing,
            workload,
            health,
            metrics,
            clock,
            reconciler,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// One reconcile pass
    pub async fn pass(&self, name: &str) -> Result<ReconcileResult, ReconcilerError> {
        self.reconciler.reconcile_workspace(NAMESPACE, name).await
    }

    /// Run passes while they ask to be requeued immediately
    ///
    /// Returns the first result that is not `RequeueNow`.
    pub async fn converge(&self, name: &str) -> ReconcileResult {
        for _ in 0..MAX_PASSES {
            let result = self
                .pass(name)
                .await
                .unwrap_or_else(|err| panic!("pass for {name} failed: {err}"));
            if result != ReconcileResult::RequeueNow {
                return result;
            }
        }
        panic!("{name} did not settle within {MAX_PASSES} passes");
    }
}
