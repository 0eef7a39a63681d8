//! # Error Policy
//!
//! Error handling and backoff logic for the controller watch loop.
//! This module handles reconciliation errors and watch stream errors.

use crate::constants::DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS;
use crate::controller::reconciler::{Reconciler, ReconcilerError};
use crate::crd::DevWorkspace;
use crate::observability::metrics;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Handle reconciliation errors with Fibonacci backoff
///
/// Backoff state is tracked per resource (`namespace/name`) so one failing
/// workspace does not slow down the others. A successful pass resets it.
pub fn handle_reconciliation_error(
    workspace: Arc<DevWorkspace>,
    error: &ReconcilerError,
    ctx: Arc<Reconciler>,
) -> Action {
    let name = workspace.name_any();
    let namespace = workspace.namespace().unwrap_or_default();

    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        resource.name = name.as_str(),
        resource.namespace = namespace.as_str(),
        error = %error
    );
    let _error_guard = error_span.enter();

    error!("Reconciliation error for {}/{}: {}", namespace, name, error);
    metrics::increment_reconciliation_errors();

    let resource_key = workspace.key();
    let (delay, error_count) = ctx.next_error_backoff(&resource_key).unwrap_or_else(|| {
        warn!("Backoff state unavailable for {}, using default requeue", resource_key);
        (Duration::from_secs(DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS), 0)
    });

    info!(
        "🔄 Retrying {} with Fibonacci backoff: {}ms (error count: {})",
        resource_key,
        delay.as_millis(),
        error_count
    );
    Action::requeue(delay)
}

/// What went wrong with the watch stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorKind {
    /// 401: RBAC revoked or token expired
    Unauthorized,
    /// 410: resource version too old
    Expired,
    /// 429: API server storage reinitializing
    Throttled,
    /// 404: CRD or object missing
    NotFound,
    Other,
}

/// Classify a watch error by its rendered message
///
/// 404 is checked before 401: a 404 returned as plain text surfaces as a
/// decode error whose chain also mentions the failed watch.
#[must_use]
pub fn classify_watch_error(error_string: &str) -> WatchErrorKind {
    let is_not_found = error_string.contains("ObjectNotFound")
        || error_string.contains("404")
        || error_string.contains("not found");
    if (error_string.contains("401") || error_string.contains("Unauthorized")) && !is_not_found {
        WatchErrorKind::Unauthorized
    } else if error_string.contains("410")
        || error_string.contains("too old resource version")
        || error_string.contains("Expired")
        || error_string.contains("Gone")
    {
        WatchErrorKind::Expired
    } else if error_string.contains("429")
        || error_string.contains("storage is (re)initializing")
        || error_string.contains("TooManyRequests")
    {
        WatchErrorKind::Throttled
    } else if is_not_found {
        WatchErrorKind::NotFound
    } else {
        WatchErrorKind::Other
    }
}

/// Handle watch stream errors with appropriate classification and backoff
///
/// Returns `None` to filter out the error (allow restart) or `Some(())` to continue.
pub async fn handle_watch_stream_error(
    error_string: &str,
    backoff: &Arc<AtomicU64>,
    max_backoff_ms: u64,
    watch_restart_delay_secs: u64,
) -> Option<()> {
    let error_span = tracing::span!(
        tracing::Level::WARN,
        "controller.watch.error",
        error = %error_string
    );
    let _error_guard = error_span.enter();

    match classify_watch_error(error_string) {
        WatchErrorKind::Unauthorized => {
            error!(
                "❌ Watch authentication failed (401 Unauthorized) - RBAC may have been revoked or token expired"
            );
            error!("🔍 Check that the controller ServiceAccount can still list devworkspaces:");
            error!(
                "      kubectl auth can-i list devworkspaces.workspace.devfile.io --as=system:serviceaccount:<namespace>:devworkspace-controller --all-namespaces"
            );
            warn!(
                "⏳ Waiting {}s before retrying watch (RBAC may need time to propagate)...",
                watch_restart_delay_secs
            );
            tokio::time::sleep(Duration::from_secs(watch_restart_delay_secs)).await;
            None
        }
        WatchErrorKind::Expired => {
            warn!(
                "Watch resource version expired (410) - this is normal during pod restarts, watch will restart"
            );
            None
        }
        WatchErrorKind::Throttled => {
            let current_backoff = backoff.load(Ordering::Relaxed);
            warn!(
                "API server storage reinitializing (429), backing off for {}ms before restart...",
                current_backoff
            );
            tokio::time::sleep(Duration::from_millis(current_backoff)).await;
            let new_backoff = current_backoff.saturating_mul(2).min(max_backoff_ms);
            backoff.store(new_backoff, Ordering::Relaxed);
            None
        }
        WatchErrorKind::NotFound => {
            warn!(
                "Resource not found (404) - this may be normal if it was deleted or the CRD is missing. Error: {}",
                error_string
            );
            Some(())
        }
        WatchErrorKind::Other => {
            error!("Controller stream error: {}", error_string);
            tokio::time::sleep(Duration::from_secs(watch_restart_delay_secs)).await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_watch_error() {
        let test_cases = vec![
            ("ApiError: Unauthorized (401)", WatchErrorKind::Unauthorized),
            (
                "WatchFailed: invalid type: integer `404`, expected a map",
                WatchErrorKind::NotFound,
            ),
            ("too old resource version: 123 (456)", WatchErrorKind::Expired),
            ("ApiError: Gone (410)", WatchErrorKind::Expired),
            (
                "storage is (re)initializing (429)",
                WatchErrorKind::Throttled,
            ),
            ("connection reset by peer", WatchErrorKind::Other),
        ];
        for (message, expected) in test_cases {
            assert_eq!(classify_watch_error(message), expected, "{message}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_doubles_backoff_up_to_max() {
        let backoff = Arc::new(AtomicU64::new(400));

        let outcome = handle_watch_stream_error("TooManyRequests", &backoff, 1000, 1).await;
        assert!(outcome.is_none(), "throttling restarts the watch");
        assert_eq!(backoff.load(Ordering::Relaxed), 800);

        handle_watch_stream_error("TooManyRequests", &backoff, 1000, 1).await;
        assert_eq!(backoff.load(Ordering::Relaxed), 1000);
    }

    #[tokio::test]
    async fn test_not_found_keeps_the_stream() {
        let backoff = Arc::new(AtomicU64::new(400));
        let outcome = handle_watch_stream_error("ObjectNotFound", &backoff, 1000, 1).await;
        assert_eq!(outcome, Some(()));
        assert_eq!(backoff.load(Ordering::Relaxed), 400);
    }
}
