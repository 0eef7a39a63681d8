//! # Custom Resource Definitions
//!
//! CRD types for the DevWorkspace controller.
//!
//! ## Module Structure
//!
//! - `spec.rs` - The DevWorkspace resource and its spec
//! - `template.rs` - Devfile template types read by the controller
//! - `status.rs` - Status, phase and condition types

mod spec;
mod status;
mod template;

// Re-export all public types
pub use spec::{ComponentContribution, DevWorkspace, DevWorkspaceSpec};
pub use status::{
    condition_types, ConditionStatus, DevWorkspaceCondition, DevWorkspaceStatus, Phase,
};
pub use template::{
    CheckoutFrom, Component, ContainerComponent, DevWorkspaceTemplateSpec, Endpoint, EnvVarDef,
    GitSource, KubeManifestComponent, KubeResourceRef, ParentRef, PluginComponent, Project,
    VolumeComponent, VolumeMountDef, ZipSource,
};
