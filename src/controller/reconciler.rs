//! # Reconciler
//!
//! The DevWorkspace reconciliation engine.
//!
//! ## Module Structure
//!
//! - `types.rs` - Reconciler context, result vocabulary, backoff state
//! - `engine.rs` - Pass entry point, gates, post-processing and status flush
//! - `pipeline.rs` - The ordered provisioning steps
//! - `lifecycle.rs` - Stop path and failing-workspace handling
//! - `cleanup.rs` - Deletion of owned objects on stop
//! - `finalize.rs` - Finalizer-driven teardown
//! - `identity.rs` - Workspace identifier allocation
//! - `errors.rs` - Error taxonomy and classification
//! - `conditions.rs` - Per-pass condition tracker
//! - `status.rs` - Merging tracked conditions into persisted status
//! - `timeout.rs` - Start and debug-hold timeouts
//! - `duration.rs` - Go-style duration parsing
//! - `health.rs` - HTTP health probe for the main endpoint

mod cleanup;
mod conditions;
pub mod duration;
mod engine;
mod errors;
mod finalize;
mod health;
mod identity;
mod lifecycle;
mod pipeline;
pub mod status;
pub mod timeout;
mod types;

pub use cleanup::delete_owned_objects;
pub use conditions::{ObservedCondition, StatusTracker};
pub use errors::{classify, FailureReason, ProvisionError, StepOutcome};
pub use finalize::{next_finalizer, KNOWN_FINALIZERS};
pub use health::{health_url, status_ready, HttpHealthProbe};
pub use identity::derive_workspace_id;
pub use types::{BackoffState, PassOutcome, ReconcileResult, Reconciler, ReconcilerError};
