//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

use std::time::Duration;

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default requeue interval for reconciliation errors (seconds)
pub const DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS: u64 = 60;

/// Default backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 1000;

/// Default backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Default delay before restarting watch stream after unknown errors (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Default delay before restarting watch stream after it ends (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS: u64 = 1;

/// Default number of workspaces reconciled in parallel
pub const DEFAULT_MAX_CONCURRENT_RECONCILIATIONS: usize = 10;

/// Name of the ConfigMap holding operator configuration (hot-reloaded)
pub const DEFAULT_CONFIG_MAP_NAME: &str = "devworkspace-controller-config";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "devworkspace-controller";

// Workspace configuration defaults

/// How long a workspace may sit in Starting without any condition changing
pub const DEFAULT_PROGRESS_TIMEOUT: &str = "5m";

/// Storage strategy used when the devfile does not pick one
pub const DEFAULT_STORAGE_CLASS_TYPE: &str = "per-user";

/// Health probe timeout; always kept below one second
pub const DEFAULT_HEALTH_PROBE_TIMEOUT_MS: u64 = 500;

/// Upper bound applied to the configured health probe timeout
pub const MAX_HEALTH_PROBE_TIMEOUT_MS: u64 = 999;

/// Requeue delay while the workload's health endpoint is not answering yet
pub const HEALTH_CHECK_REQUEUE: Duration = Duration::from_secs(1);

// Identifier allocation

/// Prefix of identifiers derived from the resource UID
pub const WORKSPACE_ID_PREFIX: &str = "workspace";

/// Maximum length accepted for a user-supplied identifier override
pub const WORKSPACE_ID_OVERRIDE_MAX_LEN: usize = 25;

// Labels

/// Label carrying the workspace identifier on every owned object
pub const DEVWORKSPACE_ID_LABEL: &str = "controller.devfile.io/devworkspace_id";

/// Label carrying the workspace name on owned pods
pub const DEVWORKSPACE_NAME_LABEL: &str = "controller.devfile.io/devworkspace_name";

/// Label naming the client that created the workspace; used as the metrics source
pub const DEVWORKSPACE_SOURCE_LABEL: &str = "controller.devfile.io/devworkspace-source";

/// Label marking secrets/configmaps that should be mounted into workspaces
pub const DEVWORKSPACE_MOUNT_LABEL: &str = "controller.devfile.io/mount-to-devworkspace";

/// Label describing which storage strategy created a PVC
pub const DEVWORKSPACE_PVC_TYPE_LABEL: &str = "controller.devfile.io/devworkspace-pvc-type";

// Annotations

/// Keeps a failing workspace's deployment around for log inspection
pub const DEVWORKSPACE_DEBUG_START_ANNOTATION: &str = "controller.devfile.io/debug-start";

/// User-supplied identifier used instead of the UID-derived one
pub const DEVWORKSPACE_ID_OVERRIDE_ANNOTATION: &str = "controller.devfile.io/devworkspace_id_override";

/// Records who or what stopped a workspace
pub const DEVWORKSPACE_STOP_REASON_ANNOTATION: &str = "controller.devfile.io/stopped-by";

/// Restricts exec/port-forward access; requires webhooks
pub const DEVWORKSPACE_RESTRICTED_ACCESS_ANNOTATION: &str = "controller.devfile.io/restricted-access";

// Devfile attributes

/// Template attribute selecting the storage strategy
pub const DEVWORKSPACE_STORAGE_TYPE_ATTRIBUTE: &str = "controller.devfile.io/storage-type";

/// Template attribute controlling the project-clone init container
pub const PROJECT_CLONE_ATTRIBUTE: &str = "controller.devfile.io/project-clone";

/// Volume component attribute requesting a projected service account token
pub const MOUNT_SA_TOKEN_ATTRIBUTE: &str = "controller.devfile.io/mount-sa-token";

// Storage types

pub const PER_USER_STORAGE_TYPE: &str = "per-user";
pub const COMMON_STORAGE_TYPE: &str = "common";
pub const PER_WORKSPACE_STORAGE_TYPE: &str = "per-workspace";
pub const EPHEMERAL_STORAGE_TYPE: &str = "ephemeral";

// Finalizers

/// Blocks deletion until workspace files on shared storage are removed
pub const STORAGE_CLEANUP_FINALIZER: &str = "storage.controller.devfile.io";

/// Blocks deletion until the workspace's role bindings are cleaned up
pub const RBAC_CLEANUP_FINALIZER: &str = "rbac.controller.devfile.io";

/// Retired finalizer; still honoured for workspaces created by older releases
pub const SERVICE_ACCOUNT_CLEANUP_FINALIZER: &str = "serviceaccount.controller.devfile.io";

// Workload layout

/// Root directory projects are cloned into
pub const PROJECTS_ROOT: &str = "/projects";

/// Volume holding cloned projects
pub const PROJECTS_VOLUME: &str = "projects";

/// Directory projected service account tokens are mounted under
pub const SA_TOKEN_MOUNT_ROOT: &str = "/var/run/secrets/tokens";

/// Label marking Secrets used as image pull secrets for workspaces
pub const DEVWORKSPACE_PULL_SECRET_LABEL: &str = "controller.devfile.io/devworkspace_pullsecret";

/// Annotation overriding where an automount object is mounted
pub const DEVWORKSPACE_MOUNT_PATH_ANNOTATION: &str = "controller.devfile.io/mount-path";

/// Annotation selecting how an automount object is mounted (`file` or `env`)
pub const DEVWORKSPACE_MOUNT_AS_ANNOTATION: &str = "controller.devfile.io/mount-as";

/// Mount path of the metadata ConfigMap
pub const METADATA_MOUNT_PATH: &str = "/devworkspace-metadata";

/// Mount path of the persistent home volume
pub const PERSISTENT_HOME_MOUNT_PATH: &str = "/home/user";

/// Name of the persistent home volume
pub const PERSISTENT_HOME_VOLUME: &str = "persistent-home";

/// Name of the project clone init container
pub const PROJECT_CLONE_CONTAINER: &str = "project-clone";

/// Key of the unresolved template in the metadata ConfigMap
pub const METADATA_ORIGINAL_KEY: &str = "original.devworkspace.yaml";

/// Key of the flattened template in the metadata ConfigMap
pub const METADATA_FLATTENED_KEY: &str = "flattened.devworkspace.yaml";
