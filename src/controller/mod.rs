//! # Controller
//!
//! Core controller modules for the DevWorkspace controller.
//!
//! - `backoff`: Fibonacci backoff for failed reconciliations
//! - `events`: Which watch events start a reconcile pass
//! - `reconciler`: The reconciliation engine
//! - `server`: HTTP server for metrics and health checks

pub mod backoff;
pub mod events;
pub mod reconciler;
pub mod server;
