//! # Types
//!
//! Core types for the reconciler.

use crate::cluster::{StoreError, WorkspaceStore};
use crate::config::SharedWorkspaceConfig;
use crate::constants::{DEFAULT_BACKOFF_MAX_MS, DEFAULT_BACKOFF_START_MS};
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::events::EventFilter;
use crate::controller::reconciler::conditions::StatusTracker;
use crate::provision::{Clock, Provisioners};
use kube_runtime::controller::Action;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Reconciliation failed: {0:#}")]
    ReconciliationFailed(#[from] anyhow::Error),
    #[error("Cluster access failed: {0}")]
    Store(#[from] StoreError),
}

/// What the controller should do after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    /// Converged; wait for the next change event
    Done,
    /// Re-read fresh state and run again immediately
    RequeueNow,
    RequeueAfter(Duration),
}

impl ReconcileResult {
    #[must_use]
    pub fn into_action(self) -> Action {
        match self {
            ReconcileResult::Done => Action::await_change(),
            ReconcileResult::RequeueNow => Action::requeue(Duration::ZERO),
            ReconcileResult::RequeueAfter(delay) => Action::requeue(delay),
        }
    }
}

/// Outcome of the main body of a pass, before post-processing
///
/// `status` is `None` when the pass must not write status at all (the
/// resource is gone, or its last finalizer was just removed). A pass that
/// ends in `Err` never writes status; its tracker is only consulted for the
/// start timeout.
#[derive(Debug)]
pub struct PassOutcome {
    pub status: Option<StatusTracker>,
    pub result: Result<ReconcileResult, ReconcilerError>,
}

impl PassOutcome {
    #[must_use]
    pub fn flush(tracker: StatusTracker, result: ReconcileResult) -> Self {
        Self {
            status: Some(tracker),
            result: Ok(result),
        }
    }

    #[must_use]
    pub fn skip_flush(result: ReconcileResult) -> Self {
        Self {
            status: None,
            result: Ok(result),
        }
    }

    /// Abort without a tracker
    #[must_use]
    pub fn abort(err: impl Into<ReconcilerError>) -> Self {
        Self {
            status: None,
            result: Err(err.into()),
        }
    }

    #[must_use]
    pub fn error(tracker: StatusTracker, err: impl Into<ReconcilerError>) -> Self {
        Self {
            status: Some(tracker),
            result: Err(err.into()),
        }
    }
}

/// Backoff state for a specific resource
/// Tracks error count and backoff calculator for progressive retries
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl BackoffState {
    #[must_use]
    pub fn new(start_ms: u64, max_ms: u64) -> Self {
        Self {
            backoff: FibonacciBackoff::new(start_ms, max_ms),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count += 1;
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_START_MS, DEFAULT_BACKOFF_MAX_MS)
    }
}

/// Engine context shared by every reconcile pass
#[derive(Clone)]
pub struct Reconciler {
    pub store: Arc<dyn WorkspaceStore>,
    pub provisioners: Provisioners,
    pub clock: Arc<dyn Clock>,
    pub config: SharedWorkspaceConfig,
    /// Event filter state for workspace, pod and PVC watches
    pub events: Arc<EventFilter>,
    // Backoff state per resource (identified by namespace/name)
    pub backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
    pub backoff_start_ms: u64,
    pub backoff_max_ms: u64,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("provisioners", &self.provisioners)
            .field("backoff_start_ms", &self.backoff_start_ms)
            .field("backoff_max_ms", &self.backoff_max_ms)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(
        store: Arc<dyn WorkspaceStore>,
        provisioners: Provisioners,
        clock: Arc<dyn Clock>,
        config: SharedWorkspaceConfig,
    ) -> Self {
        Self {
            store,
            provisioners,
            clock,
            config,
            events: Arc::new(EventFilter::default()),
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
        }
    }

    /// Bounds for the per-resource error backoff
    #[must_use]
    pub fn with_backoff(mut self, start_ms: u64, max_ms: u64) -> Self {
        self.backoff_start_ms = start_ms;
        self.backoff_max_ms = max_ms;
        self
    }

    /// Forget accumulated errors for `key` after a successful pass
    ///
    /// Returns true when the resource had been backing off.
    pub fn reset_backoff(&self, key: &str) -> bool {
        let Ok(mut states) = self.backoff_states.lock() else {
            return false;
        };
        match states.get_mut(key) {
            Some(state) => {
                let had_errors = state.error_count > 0;
                state.reset();
                had_errors
            }
            None => false,
        }
    }

    /// Record an error for `key` and return the delay before the next attempt
    ///
    /// `None` when the backoff table is unavailable.
    pub fn next_error_backoff(&self, key: &str) -> Option<(Duration, u32)> {
        let mut states = self.backoff_states.lock().ok()?;
        let state = states
            .entry(key.to_string())
            .or_insert_with(|| BackoffState::new(self.backoff_start_ms, self.backoff_max_ms));
        state.increment_error();
        Some((state.backoff.next_backoff(), state.error_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_vocabulary_maps_to_actions() {
        assert_eq!(ReconcileResult::Done.into_action(), Action::await_change());
        assert_eq!(
            ReconcileResult::RequeueNow.into_action(),
            Action::requeue(Duration::ZERO)
        );
        assert_eq!(
            ReconcileResult::RequeueAfter(Duration::from_secs(5)).into_action(),
            Action::requeue(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_backoff_state_reset() {
        let mut state = BackoffState::new(1000, 10_000);
        state.increment_error();
        state.increment_error();
        state.backoff.next_backoff_ms();
        state.backoff.next_backoff_ms();
        state.backoff.next_backoff_ms();

        state.reset();

        assert_eq!(state.error_count, 0);
        assert_eq!(state.backoff.next_backoff_ms(), 1000);
    }
}
