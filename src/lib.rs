//! DevWorkspace Controller Library
//!
//! Reconciliation engine for DevWorkspace resources, the collaborators it
//! drives, and the runtime that wires it to a cluster.
//!
//! ## Quick Start
//!
//! ```rust
//! use devworkspace_controller::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod cluster;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod provision;
pub mod runtime;
