//! # Timeout Detection
//!
//! Pure checks over persisted condition timestamps.
//!
//! - `check_start_timeout`: a Starting workspace whose conditions have not
//!   changed for longer than the progress timeout.
//! - `check_failing_timeout`: how long a Failing workspace held by the
//!   debug annotation has left before it is stopped. Anchored on the
//!   FailedStart condition alone.
//!
//! Both fail closed on an unparsable timeout.

use crate::controller::reconciler::conditions::{ObservedCondition, StatusTracker};
use crate::controller::reconciler::duration::{parse_duration, DurationError};
use crate::crd::{condition_types, DevWorkspaceStatus, Phase};
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutError {
    #[error("DevWorkspace failed to progress past step '{step}' for longer than timeout ({timeout})")]
    Expired { step: String, timeout: String },
    #[error("invalid duration specified for timeout: {0}")]
    InvalidDuration(#[from] DurationError),
}

/// State of the debug hold on a Failing workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailingTimeout {
    /// Not in the Failing phase; nothing to hold
    NotFailing,
    /// Held; stop once `remaining` has elapsed
    Holding { remaining: Duration },
    /// Hold expired; the workspace should be stopped
    Expired,
}

/// Parse an RFC3339 transition time; unparsable values are ignored
fn transition_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn step_name(condition_type: &str, condition: &ObservedCondition) -> String {
    if condition.message.is_empty() {
        condition_type.to_string()
    } else {
        condition.message.clone()
    }
}

/// Check whether a Starting workspace has stalled
///
/// The error names the step the workspace is stuck on: the first False
/// condition observed this pass, else the last True one, else the phase.
///
/// # Errors
///
/// [`TimeoutError::Expired`] when stalled, [`TimeoutError::InvalidDuration`]
/// when `progress_timeout` cannot be parsed.
pub fn check_start_timeout(
    status: &DevWorkspaceStatus,
    tracker: &StatusTracker,
    progress_timeout: &str,
    now: DateTime<Utc>,
) -> Result<(), TimeoutError> {
    if status.phase != Some(Phase::Starting) {
        return Ok(());
    }
    let timeout = parse_duration(progress_timeout)?;

    let Some(last_update) = status
        .conditions
        .iter()
        .filter_map(|c| transition_time(c.last_transition_time.as_deref()))
        .max()
    else {
        return Ok(());
    };

    if last_update + to_chrono(timeout) < now {
        let step = tracker
            .first_false()
            .or_else(|| tracker.last_true())
            .map_or_else(|| Phase::Starting.to_string(), |(t, c)| step_name(t, c));
        return Err(TimeoutError::Expired {
            step,
            timeout: progress_timeout.to_string(),
        });
    }
    Ok(())
}

/// Check how long a Failing workspace may still be held for debugging
///
/// A Failing workspace without a readable FailedStart timestamp is held for
/// the full timeout from now.
///
/// # Errors
///
/// [`TimeoutError::InvalidDuration`] when `progress_timeout` cannot be parsed.
pub fn check_failing_timeout(
    status: &DevWorkspaceStatus,
    progress_timeout: &str,
    now: DateTime<Utc>,
) -> Result<FailingTimeout, TimeoutError> {
    if status.phase != Some(Phase::Failing) {
        return Ok(FailingTimeout::NotFailing);
    }
    let timeout = parse_duration(progress_timeout)?;

    let Some(failed_at) = status
        .condition(condition_types::FAILED_START)
        .and_then(|c| transition_time(c.last_transition_time.as_deref()))
    else {
        return Ok(FailingTimeout::Holding { remaining: timeout });
    };

    let deadline = failed_at + to_chrono(timeout);
    if deadline < now {
        Ok(FailingTimeout::Expired)
    } else {
        let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
        Ok(FailingTimeout::Holding { remaining })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ConditionStatus, DevWorkspaceCondition};
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
    }

    fn condition(condition_type: &str, minute: u32) -> DevWorkspaceCondition {
        DevWorkspaceCondition {
            r#type: condition_type.to_string(),
            status: ConditionStatus::True,
            last_transition_time: Some(at(minute).to_rfc3339()),
            message: String::new(),
            reason: None,
        }
    }

    fn status(phase: Phase, conditions: Vec<DevWorkspaceCondition>) -> DevWorkspaceStatus {
        DevWorkspaceStatus {
            phase: Some(phase),
            conditions,
            ..Default::default()
        }
    }

    #[test]
    fn test_start_timeout_only_applies_while_starting() {
        let status = status(Phase::Running, vec![condition(condition_types::STARTED, 0)]);
        let tracker = StatusTracker::new(Phase::Running);
        assert_eq!(check_start_timeout(&status, &tracker, "5m", at(30)), Ok(()));
    }

    #[test]
    fn test_start_timeout_uses_latest_transition() {
        let status = status(
            Phase::Starting,
            vec![
                condition(condition_types::STARTED, 0),
                condition(condition_types::STORAGE_READY, 8),
            ],
        );
        let tracker = StatusTracker::new(Phase::Starting);
        assert_eq!(check_start_timeout(&status, &tracker, "5m", at(12)), Ok(()));
        assert!(check_start_timeout(&status, &tracker, "5m", at(14)).is_err());
    }

    #[test]
    fn test_start_timeout_names_blocking_step() {
        let status = status(Phase::Starting, vec![condition(condition_types::STARTED, 0)]);

        let mut tracker = StatusTracker::new(Phase::Starting);
        tracker.set_condition_true(condition_types::STARTED, "DevWorkspace is starting");
        tracker.set_condition_true(condition_types::ROUTING_READY, "Networking ready");
        tracker.set_condition_false(
            condition_types::DEPLOYMENT_READY,
            "Waiting for workspace deployment",
        );

        let err = check_start_timeout(&status, &tracker, "5m", at(10)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "DevWorkspace failed to progress past step 'Waiting for workspace deployment' for longer than timeout (5m)"
        );
    }

    #[test]
    fn test_start_timeout_falls_back_to_last_true_then_phase() {
        let status = status(Phase::Starting, vec![condition(condition_types::STARTED, 0)]);

        let mut tracker = StatusTracker::new(Phase::Starting);
        tracker.set_condition_true(condition_types::STORAGE_READY, "Storage ready");
        match check_start_timeout(&status, &tracker, "5m", at(10)) {
            Err(TimeoutError::Expired { step, .. }) => assert_eq!(step, "Storage ready"),
            other => panic!("expected timeout, got {other:?}"),
        }

        let empty = StatusTracker::new(Phase::Starting);
        match check_start_timeout(&status, &empty, "5m", at(10)) {
            Err(TimeoutError::Expired { step, .. }) => assert_eq!(step, "Starting"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_timeouts_fail_closed_on_bad_duration() {
        let starting = status(Phase::Starting, vec![condition(condition_types::STARTED, 0)]);
        let tracker = StatusTracker::new(Phase::Starting);
        let err = check_start_timeout(&starting, &tracker, "five minutes", at(1)).unwrap_err();
        assert!(matches!(err, TimeoutError::InvalidDuration(_)));
        assert!(err.to_string().starts_with("invalid duration specified for timeout"));

        let failing = status(Phase::Failing, vec![condition(condition_types::FAILED_START, 0)]);
        assert!(matches!(
            check_failing_timeout(&failing, "", at(1)),
            Err(TimeoutError::InvalidDuration(DurationError::Empty))
        ));
    }

    #[test]
    fn test_failing_timeout_anchors_on_failed_start() {
        // A later transition on another condition must not extend the hold
        let failing = status(
            Phase::Failing,
            vec![
                condition(condition_types::FAILED_START, 0),
                condition(condition_types::STARTED, 9),
            ],
        );
        assert_eq!(
            check_failing_timeout(&failing, "5m", at(3)),
            Ok(FailingTimeout::Holding {
                remaining: Duration::from_secs(120)
            })
        );
        assert_eq!(
            check_failing_timeout(&failing, "5m", at(6)),
            Ok(FailingTimeout::Expired)
        );
    }

    #[test]
    fn test_failing_timeout_not_failing() {
        let running = status(Phase::Running, vec![]);
        assert_eq!(
            check_failing_timeout(&running, "5m", at(0)),
            Ok(FailingTimeout::NotFailing)
        );
    }
}
