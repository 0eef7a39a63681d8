//! # Condition Tracker
//!
//! Collects the conditions and target phase observed during a single
//! reconcile pass. A tracker is created fresh for every pass, owned by the
//! pass driver, and handed to the status synchronizer when the pass ends.

use crate::controller::reconciler::errors::FailureReason;
use crate::crd::{condition_types, ConditionStatus, DevWorkspaceCondition, Phase};
use std::collections::BTreeMap;

/// A condition as observed this pass (no timestamp yet)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedCondition {
    pub status: ConditionStatus,
    pub message: String,
    pub reason: Option<String>,
}

impl ObservedCondition {
    #[must_use]
    pub fn from_persisted(condition: &DevWorkspaceCondition) -> Self {
        Self {
            status: condition.status,
            message: condition.message.clone(),
            reason: condition.reason.clone(),
        }
    }
}

/// Per-pass aggregator of observed conditions, warnings and phase
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTracker {
    phase: Phase,
    conditions: BTreeMap<String, ObservedCondition>,
    warnings: Vec<ObservedCondition>,
    main_url: Option<String>,
}

impl StatusTracker {
    #[must_use]
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            conditions: BTreeMap::new(),
            warnings: Vec::new(),
            main_url: None,
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn set_condition_true(&mut self, condition_type: &str, message: impl Into<String>) {
        self.set_condition(
            condition_type,
            ObservedCondition {
                status: ConditionStatus::True,
                message: message.into(),
                reason: None,
            },
        );
    }

    pub fn set_condition_true_with_reason(
        &mut self,
        condition_type: &str,
        message: impl Into<String>,
        reason: impl Into<String>,
    ) {
        self.set_condition(
            condition_type,
            ObservedCondition {
                status: ConditionStatus::True,
                message: message.into(),
                reason: Some(reason.into()),
            },
        );
    }

    pub fn set_condition_false(&mut self, condition_type: &str, message: impl Into<String>) {
        self.set_condition(
            condition_type,
            ObservedCondition {
                status: ConditionStatus::False,
                message: message.into(),
                reason: None,
            },
        );
    }

    /// Record a condition; warnings go through [`Self::add_warning`]
    pub fn set_condition(&mut self, condition_type: &str, condition: ObservedCondition) {
        if condition_type == condition_types::WARNING {
            self.add_warning(condition.message, condition.reason);
            return;
        }
        self.conditions.insert(condition_type.to_string(), condition);
    }

    /// Add a warning; warnings are identified by message
    pub fn add_warning(&mut self, message: impl Into<String>, reason: Option<String>) {
        let message = message.into();
        if let Some(existing) = self.warnings.iter_mut().find(|w| w.message == message) {
            existing.reason = reason;
            return;
        }
        self.warnings.push(ObservedCondition {
            status: ConditionStatus::True,
            message,
            reason,
        });
    }

    /// Move to the internal Failing phase with a FailedStart condition
    pub fn fail(&mut self, message: impl Into<String>, reason: FailureReason) {
        self.phase = Phase::Failing;
        self.set_condition_true_with_reason(
            condition_types::FAILED_START,
            message,
            reason.as_str(),
        );
    }

    #[must_use]
    pub fn condition(&self, condition_type: &str) -> Option<&ObservedCondition> {
        self.conditions.get(condition_type)
    }

    /// Observed conditions, excluding warnings
    pub fn conditions(&self) -> impl Iterator<Item = (&str, &ObservedCondition)> {
        self.conditions.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn warnings(&self) -> &[ObservedCondition] {
        &self.warnings
    }

    /// First condition, in priority order, that is False: the step the
    /// workspace is currently blocked on
    #[must_use]
    pub fn first_false(&self) -> Option<(&'static str, &ObservedCondition)> {
        condition_types::PRIORITY_ORDER.iter().find_map(|t| {
            self.conditions
                .get(*t)
                .filter(|c| c.status == ConditionStatus::False)
                .map(|c| (*t, c))
        })
    }

    /// Last condition, in priority order, that is True: the furthest step reached
    #[must_use]
    pub fn last_true(&self) -> Option<(&'static str, &ObservedCondition)> {
        condition_types::PRIORITY_ORDER.iter().rev().find_map(|t| {
            self.conditions
                .get(*t)
                .filter(|c| c.status == ConditionStatus::True)
                .map(|c| (*t, c))
        })
    }

    /// Main URL resolved this pass, if routing got that far
    #[must_use]
    pub fn main_url(&self) -> Option<&str> {
        self.main_url.as_deref()
    }

    pub fn set_main_url(&mut self, url: impl Into<String>) {
        self.main_url = Some(url.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::condition_types::*;

    #[test]
    fn test_first_false_follows_priority_not_insertion_order() {
        let mut tracker = StatusTracker::new(Phase::Starting);
        tracker.set_condition_false(DEPLOYMENT_READY, "Waiting for workspace deployment");
        tracker.set_condition_true(STARTED, "DevWorkspace is starting");
        tracker.set_condition_false(ROUTING_READY, "Preparing networking");

        let (condition_type, condition) = tracker.first_false().unwrap();
        assert_eq!(condition_type, ROUTING_READY);
        assert_eq!(condition.message, "Preparing networking");
    }

    #[test]
    fn test_last_true_reports_furthest_step() {
        let mut tracker = StatusTracker::new(Phase::Starting);
        tracker.set_condition_true(STARTED, "DevWorkspace is starting");
        tracker.set_condition_true(STORAGE_READY, "Storage ready");
        tracker.set_condition_true(DEVWORKSPACE_RESOLVED, "Resolved DevWorkspace");

        let (condition_type, _) = tracker.last_true().unwrap();
        assert_eq!(condition_type, STORAGE_READY);
        assert!(tracker.first_false().is_none());
    }

    #[test]
    fn test_queries_ignore_types_outside_priority_order() {
        let mut tracker = StatusTracker::new(Phase::Starting);
        tracker.set_condition_true(FAILED_START, "boom");
        assert!(tracker.last_true().is_none());
        assert!(tracker.first_false().is_none());
    }

    #[test]
    fn test_warnings_are_keyed_by_message() {
        let mut tracker = StatusTracker::new(Phase::Starting);
        tracker.add_warning("unused variable 'foo'", None);
        tracker.add_warning("unused variable 'bar'", None);
        tracker.add_warning("unused variable 'foo'", Some("Devfile".to_string()));
        tracker.set_condition_true(WARNING, "routing class is deprecated");

        let messages: Vec<&str> = tracker.warnings().iter().map(|w| w.message.as_str()).collect();
        assert_eq!(
            messages,
            vec!["unused variable 'foo'", "unused variable 'bar'", "routing class is deprecated"]
        );
        assert_eq!(tracker.warnings()[0].reason.as_deref(), Some("Devfile"));
        assert!(tracker.condition(WARNING).is_none());
    }

    #[test]
    fn test_fail_sets_phase_and_reason() {
        let mut tracker = StatusTracker::new(Phase::Starting);
        tracker.fail("Error provisioning storage: no PVC", FailureReason::InfrastructureFailure);

        assert_eq!(tracker.phase(), Phase::Failing);
        let failed = tracker.condition(FAILED_START).unwrap();
        assert_eq!(failed.status, ConditionStatus::True);
        assert_eq!(failed.reason.as_deref(), Some("InfrastructureFailure"));
    }
}
