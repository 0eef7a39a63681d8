//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ```rust
//! use devworkspace_controller::prelude::*;
//! ```

// CRD types - most commonly used
pub use crate::crd::*;

// Collaborator seams - needed for implementing provisioners
pub use crate::provision::{
    AccessController, AutomountProvider, Clock, HealthProbe, IdentitySynchronizer, MetricsSink,
    PodAdditions, Provisioners, PullSecretSynchronizer, RoutingSynchronizer, StorageProvisioner,
    StorageRegistry, SubResourceSynchronizer, TemplateResolver, WorkloadSynchronizer,
};

// Engine types
pub use crate::controller::reconciler::{
    FailureReason, ProvisionError, ReconcileResult, Reconciler, ReconcilerError, StatusTracker,
};

pub use crate::cluster::{StoreError, WorkspaceStore};

pub use crate::config::{ControllerConfig, ServerConfig, WorkspaceConfig};
