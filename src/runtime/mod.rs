//! # Runtime
//!
//! Process wiring around the reconciliation engine.
//!
//! - `initialization`: rustls, tracing, metrics, HTTP server, client and engine setup
//! - `watch_loop`: the kube-runtime `Controller` and its watches
//! - `error_policy`: backoff for failed passes and watch stream errors

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;

pub use initialization::{initialize, InitializationResult};
pub use watch_loop::run_watch_loop;
