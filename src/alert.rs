//! Hysteresis alert evaluation
//!
//! A device goes "down" only after `failure_threshold` consecutive failed probes
//! and comes back only after `recovery_threshold` consecutive successes. The
//! evaluation is a pure function of the previous [`AlertState`] and one probe
//! outcome; persisting the new state and publishing events is the
//! orchestrator's job.

use chrono::{DateTime, Utc};

use crate::AlertState;
use crate::config::AlertingConfig;

/// Alert transition caused by a single probe outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertTransition {
    /// The device just crossed the failure threshold
    Triggered,

    /// The device just crossed the recovery threshold
    Resolved,
}

/// New state plus the transition (if any) that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvaluation {
    pub state: AlertState,
    pub transition: Option<AlertTransition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertPolicy {
    failure_threshold: u32,
    recovery_threshold: u32,
}

impl AlertPolicy {
    pub fn new(failure_threshold: u32, recovery_threshold: u32) -> Self {
        Self {
            failure_threshold,
            recovery_threshold,
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn recovery_threshold(&self) -> u32 {
        self.recovery_threshold
    }

    pub fn evaluate(&self, state: AlertState, success: bool, now: DateTime<Utc>) -> AlertEvaluation {
        if success {
            let state = state.record_success(now);
            if state.should_resolve_alert(self.recovery_threshold) {
                return AlertEvaluation {
                    state: state.deactivate_alert(now),
                    transition: Some(AlertTransition::Resolved),
                };
            }
            return AlertEvaluation {
                state,
                transition: None,
            };
        }

        let state = state.record_failure(now);
        if state.should_trigger_alert(self.failure_threshold) {
            return AlertEvaluation {
                state: state.activate_alert(now),
                transition: Some(AlertTransition::Triggered),
            };
        }

        AlertEvaluation {
            state,
            transition: None,
        }
    }
}

impl From<&AlertingConfig> for AlertPolicy {
    fn from(config: &AlertingConfig) -> Self {
        Self::new(config.failure_threshold, config.recovery_threshold)
    }
}

// ============================================================================
// Tests
// ============================================================================
