//! # Metrics
//!
//! Prometheus metrics for monitoring the controller and the workspaces it drives.
//!
//! ## Metrics Exposed
//!
//! - `devworkspace_started_total{source}` - Workspaces that began starting
//! - `devworkspace_started_success_total{source}` - Workspaces that reached Running
//! - `devworkspace_fail_total{source, reason}` - Workspaces that entered Failing
//! - `devworkspace_startup_time{source}` - Seconds from the Started condition to Running
//! - `devworkspace_controller_reconciliations_total` - Total number of reconcile passes
//! - `devworkspace_controller_reconciliation_errors_total` - Passes that ended in an error
//! - `devworkspace_controller_reconciliation_duration_seconds` - Duration of reconcile passes

use crate::constants::DEVWORKSPACE_SOURCE_LABEL;
use crate::controller::reconciler::FailureReason;
use crate::crd::DevWorkspace;
use crate::provision::MetricsSink;
use anyhow::Result;
use prometheus::{Histogram, HistogramVec, IntCounter, IntCounterVec, Registry};
use std::sync::LazyLock;
use std::time::Duration;

/// Source label value when the workspace does not name one
pub const UNKNOWN_SOURCE: &str = "unknown";

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static WORKSPACE_STARTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "devworkspace_started_total",
            "Number of DevWorkspace start events",
        ),
        &["source"],
    )
    .expect("Failed to create WORKSPACE_STARTS_TOTAL metric - this should never happen")
});

static WORKSPACE_STARTS_SUCCESS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "devworkspace_started_success_total",
            "Number of DevWorkspaces that reached the Running phase",
        ),
        &["source"],
    )
    .expect("Failed to create WORKSPACE_STARTS_SUCCESS_TOTAL metric - this should never happen")
});

static WORKSPACE_FAILURES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "devworkspace_fail_total",
            "Number of DevWorkspaces that failed to start",
        ),
        &["source", "reason"],
    )
    .expect("Failed to create WORKSPACE_FAILURES_TOTAL metric - this should never happen")
});

static WORKSPACE_STARTUP_TIME: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "devworkspace_startup_time",
            "Seconds from a DevWorkspace starting to it reaching the Running phase",
        )
        .buckets(prometheus::linear_buckets(10.0, 10.0, 18).unwrap_or_default()),
        &["source"],
    )
    .expect("Failed to create WORKSPACE_STARTUP_TIME metric - this should never happen")
});

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "devworkspace_controller_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "devworkspace_controller_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "devworkspace_controller_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

/// Register every metric with the process registry
///
/// # Errors
///
/// Returns an error if a metric is registered twice.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(WORKSPACE_STARTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WORKSPACE_STARTS_SUCCESS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WORKSPACE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WORKSPACE_STARTUP_TIME.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    Ok(())
}

/// Collect everything registered, for the `/metrics` endpoint
#[must_use]
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

/// The `source` label value for a workspace
#[must_use]
pub fn workspace_source(workspace: &DevWorkspace) -> &str {
    workspace
        .label(DEVWORKSPACE_SOURCE_LABEL)
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_SOURCE)
}

/// Workspace lifecycle metrics backed by the process registry
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

impl MetricsSink for PrometheusMetrics {
    fn started(&self, workspace: &DevWorkspace) {
        WORKSPACE_STARTS_TOTAL
            .with_label_values(&[workspace_source(workspace)])
            .inc();
    }

    fn running(&self, workspace: &DevWorkspace, startup: Option<Duration>) {
        let source = workspace_source(workspace);
        WORKSPACE_STARTS_SUCCESS_TOTAL
            .with_label_values(&[source])
            .inc();
        if let Some(startup) = startup {
            WORKSPACE_STARTUP_TIME
                .with_label_values(&[source])
                .observe(startup.as_secs_f64());
        }
    }

    fn failed(&self, workspace: &DevWorkspace, reason: FailureReason) {
        WORKSPACE_FAILURES_TOTAL
            .with_label_values(&[workspace_source(workspace), reason.as_str()])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DevWorkspaceSpec;
    use std::collections::BTreeMap;

    fn workspace(source: Option<&str>) -> DevWorkspace {
        let mut ws = DevWorkspace::new("ws", DevWorkspaceSpec::default());
        if let Some(source) = source {
            ws.metadata.labels = Some(BTreeMap::from([(
                DEVWORKSPACE_SOURCE_LABEL.to_string(),
                source.to_string(),
            )]));
        }
        ws
    }

    #[test]
    fn test_register_metrics() {
        // This should not panic - metrics should register successfully
        assert!(register_metrics().is_ok());
    }

    #[test]
    fn test_workspace_source() {
        let test_cases = vec![
            (Some("web-console"), "web-console"),
            (Some(""), UNKNOWN_SOURCE),
            (None, UNKNOWN_SOURCE),
        ];
        for (label, expected) in test_cases {
            assert_eq!(
                workspace_source(&workspace(label)),
                expected,
                "label {label:?}"
            );
        }
    }

    #[test]
    fn test_started_counts_per_source() {
        let ws = workspace(Some("metrics-started"));
        let before = WORKSPACE_STARTS_TOTAL
            .with_label_values(&["metrics-started"])
            .get();
        PrometheusMetrics.started(&ws);
        let after = WORKSPACE_STARTS_TOTAL
            .with_label_values(&["metrics-started"])
            .get();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn test_running_observes_startup_time() {
        let ws = workspace(Some("metrics-running"));
        let histogram = WORKSPACE_STARTUP_TIME.with_label_values(&["metrics-running"]);
        let before = histogram.get_sample_count();

        PrometheusMetrics.running(&ws, Some(Duration::from_secs(42)));
        PrometheusMetrics.running(&ws, None);

        assert_eq!(histogram.get_sample_count(), before + 1);
        assert_eq!(
            WORKSPACE_STARTS_SUCCESS_TOTAL
                .with_label_values(&["metrics-running"])
                .get(),
            2
        );
    }

    #[test]
    fn test_failed_counts_by_reason() {
        let ws = workspace(Some("metrics-failed"));
        PrometheusMetrics.failed(&ws, FailureReason::BadRequest);
        PrometheusMetrics.failed(&ws, FailureReason::BadRequest);
        PrometheusMetrics.failed(&ws, FailureReason::InfrastructureFailure);

        let count = |reason: &str| {
            WORKSPACE_FAILURES_TOTAL
                .with_label_values(&["metrics-failed", reason])
                .get()
        };
        assert_eq!(count("BadRequest"), 2);
        assert_eq!(count("InfrastructureFailure"), 1);
    }

    #[test]
    fn test_increment_reconciliations() {
        let before = RECONCILIATIONS_TOTAL.get();
        increment_reconciliations();
        let after = RECONCILIATIONS_TOTAL.get();
        assert_eq!(after, before + 1u64);
    }

    #[test]
    fn test_increment_reconciliation_errors() {
        let before = RECONCILIATION_ERRORS_TOTAL.get();
        increment_reconciliation_errors();
        let after = RECONCILIATION_ERRORS_TOTAL.get();
        assert_eq!(after, before + 1u64);
    }
}
