//! # Observability
//!
//! - `metrics`: Prometheus metrics collection and the workspace lifecycle sink

pub mod metrics;

pub use metrics::PrometheusMetrics;
