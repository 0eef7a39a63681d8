//! # Status Synchronization
//!
//! Merges one pass worth of observations from the [`StatusTracker`] into the
//! persisted status. Everything here is pure; the single write per pass
//! happens in the engine's flush.
//!
//! Merge rules:
//! - Persisted conditions not observed this pass go to Unknown with an empty
//!   message and reason. Conditions that are already in that state keep their
//!   timestamp, so converged passes stay write-free.
//! - Observed conditions are re-stamped only when status, message or reason
//!   changed.
//! - Warnings are keyed by message. Warnings not seen again are dropped.
//! - The result is sorted by (priority, message).

use crate::controller::reconciler::conditions::{ObservedCondition, StatusTracker};
use crate::crd::{condition_types, ConditionStatus, DevWorkspaceCondition, DevWorkspaceStatus, Phase};
use chrono::{DateTime, SecondsFormat, Utc};
use std::cmp::Ordering;

/// Timestamp format used for condition transitions
#[must_use]
pub fn format_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn differs(persisted: &DevWorkspaceCondition, observed: &ObservedCondition) -> bool {
    persisted.status != observed.status
        || persisted.message != observed.message
        || persisted.reason != observed.reason
}

fn stamped(condition_type: &str, observed: &ObservedCondition, now: &str) -> DevWorkspaceCondition {
    DevWorkspaceCondition {
        r#type: condition_type.to_string(),
        status: observed.status,
        last_transition_time: Some(now.to_string()),
        message: observed.message.clone(),
        reason: observed.reason.clone(),
    }
}

/// Merge tracked conditions into the persisted list
#[must_use]
pub fn sync_conditions(
    persisted: &[DevWorkspaceCondition],
    tracker: &StatusTracker,
    now: &str,
) -> Vec<DevWorkspaceCondition> {
    let mut merged: Vec<DevWorkspaceCondition> = Vec::with_capacity(persisted.len());

    for condition in persisted
        .iter()
        .filter(|c| c.r#type != condition_types::WARNING)
    {
        match tracker.condition(&condition.r#type) {
            Some(observed) if differs(condition, observed) => {
                merged.push(stamped(&condition.r#type, observed, now));
            }
            Some(_) => merged.push(condition.clone()),
            None => {
                let already_unknown = condition.status == ConditionStatus::Unknown
                    && condition.message.is_empty()
                    && condition.reason.is_none();
                if already_unknown {
                    merged.push(condition.clone());
                } else {
                    merged.push(DevWorkspaceCondition {
                        r#type: condition.r#type.clone(),
                        status: ConditionStatus::Unknown,
                        last_transition_time: Some(now.to_string()),
                        message: String::new(),
                        reason: None,
                    });
                }
            }
        }
    }

    for (condition_type, observed) in tracker.conditions() {
        if !merged.iter().any(|c| c.r#type == condition_type) {
            merged.push(stamped(condition_type, observed, now));
        }
    }

    for warning in tracker.warnings() {
        let existing = persisted
            .iter()
            .find(|c| c.r#type == condition_types::WARNING && c.message == warning.message);
        match existing {
            Some(previous)
                if previous.status == warning.status && previous.reason == warning.reason =>
            {
                merged.push(previous.clone());
            }
            _ => merged.push(stamped(condition_types::WARNING, warning, now)),
        }
    }

    sort_conditions(&mut merged);
    merged
}

/// Sort by fixed priority, then by message
pub fn sort_conditions(conditions: &mut [DevWorkspaceCondition]) {
    conditions.sort_by(|a, b| {
        match condition_types::priority(&a.r#type).cmp(&condition_types::priority(&b.r#type)) {
            Ordering::Equal => a.message.cmp(&b.message),
            other => other,
        }
    });
}

/// Single human-readable summary of the pass
///
/// Error condition, then FailedStart, then phase-specific text, then the
/// blocking step, then the furthest step reached.
#[must_use]
pub fn summary_message(tracker: &StatusTracker, main_url: &str) -> String {
    let base = summary_base(tracker, main_url);
    match tracker.warnings().len() {
        0 => base,
        1 => format!("{base} (1 warning)"),
        n => format!("{base} ({n} warnings)"),
    }
}

fn summary_base(tracker: &StatusTracker, main_url: &str) -> String {
    if let Some(error) = tracker.condition(condition_types::ERROR) {
        return error.message.clone();
    }
    if let Some(failed) = tracker.condition(condition_types::FAILED_START) {
        return failed.message.clone();
    }
    match tracker.phase() {
        Phase::Running if !main_url.is_empty() => return main_url.to_string(),
        phase @ (Phase::Stopped | Phase::Stopping) => return phase.to_string(),
        _ => {}
    }
    if let Some((_, condition)) = tracker.first_false() {
        return condition.message.clone();
    }
    if let Some((_, condition)) = tracker.last_true() {
        return condition.message.clone();
    }
    String::new()
}

/// Status to persist at the end of a pass
///
/// Identifier is always carried over. The main URL is replaced only when
/// routing resolved one this pass.
#[must_use]
pub fn merged_status(
    current: &DevWorkspaceStatus,
    tracker: &StatusTracker,
    now: DateTime<Utc>,
) -> DevWorkspaceStatus {
    let main_url = tracker
        .main_url()
        .map_or_else(|| current.main_url.clone(), str::to_string);
    DevWorkspaceStatus {
        devworkspace_id: current.devworkspace_id.clone(),
        phase: Some(tracker.phase()),
        conditions: sync_conditions(&current.conditions, tracker, &format_timestamp(now)),
        message: summary_message(tracker, &main_url),
        main_url,
    }
}
