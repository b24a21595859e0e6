use cartridge_core::error::{EngineError, EngineResult};

use crate::types::InstanceStatus;

/// Describes a single valid state transition for a cartridge instance.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: InstanceStatus,
    pub to: InstanceStatus,
    pub trigger: &'static str,
}

/// Guards instance lifecycle by enforcing a finite set of valid state
/// transitions. Suppression is reachable from every non-terminal state and
/// from nowhere back.
#[derive(Debug, Clone)]
pub struct InstanceStateMachine {
    transitions: Vec<StateTransition>,
}

impl InstanceStateMachine {
    pub fn new() -> Self {
        let transitions = vec![
            // Active ->
            StateTransition {
                from: InstanceStatus::Active,
                to: InstanceStatus::Paused,
                trigger: "operator_pause",
            },
            StateTransition {
                from: InstanceStatus::Active,
                to: InstanceStatus::Halted,
                trigger: "stages_exhausted",
            },
            StateTransition {
                from: InstanceStatus::Active,
                to: InstanceStatus::Completed,
                trigger: "terminal_positive_reply",
            },
            StateTransition {
                from: InstanceStatus::Active,
                to: InstanceStatus::Suppressed,
                trigger: "compliance_suppress",
            },
            // Paused ->
            StateTransition {
                from: InstanceStatus::Paused,
                to: InstanceStatus::Active,
                trigger: "operator_resume",
            },
            StateTransition {
                from: InstanceStatus::Paused,
                to: InstanceStatus::Suppressed,
                trigger: "compliance_suppress",
            },
        ];

        Self { transitions }
    }

    /// Returns `true` if the given transition is allowed. A no-move
    /// "transition" is never allowed; callers treat same-state as a no-op
    /// before consulting the table.
    pub fn can_transition(&self, from: InstanceStatus, to: InstanceStatus) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.to == to)
    }

    /// Validate a move, returning the trigger name that permits it.
    pub fn transition(&self, from: InstanceStatus, to: InstanceStatus) -> EngineResult<&'static str> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
            .map(|t| t.trigger)
            .ok_or_else(|| EngineError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            })
    }
}

impl Default for InstanceStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
