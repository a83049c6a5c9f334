use crossbeam::atomic::AtomicCell;
use snafu::Snafu;

use NvmeControllerState::*;

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum NvmeControllerState {
    New,
    Initializing,
    Running,
    Resetting,
    Faulted(ControllerFailureReason),
    Unconfiguring,
    Unconfigured,
}

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum ControllerFailureReason {
    ResetFailed,
    ShutdownFailed,
    NamespaceInit,
    Removed,
}

impl ToString for NvmeControllerState {
    fn to_string(&self) -> String {
        match *self {
            Self::New => "New",
            Self::Initializing => "Initializing",
            Self::Running => "Running",
            Self::Resetting => "Resetting",
            Self::Unconfiguring => "Unconfiguring",
            Self::Unconfigured => "Unconfigured",
            Self::Faulted(_) => "Faulted",
        }
        .to_string()
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum ControllerFlag {
    ResetActive,
}

/// Manages the state and flags of an NVMe controller.
///
/// Every controller passes through different states during its lifetime,
/// which makes it important to control state transitions and disallow
/// invalid state changes. Flags carry the extra booleans (an active reset)
/// that do not warrant a state of their own.
#[derive(Debug)]
pub struct ControllerStateMachine {
    name: String,
    current_state: NvmeControllerState,
    flag: AtomicCell<bool>,
}

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility = "pub")]
pub enum ControllerStateMachineError {
    #[snafu(display(
        "invalid transition from {:?} to {:?}",
        current_state,
        new_state
    ))]
    ControllerStateTransitionError {
        current_state: NvmeControllerState,
        new_state: NvmeControllerState,
    },
    #[snafu(display(
        "failed to exclusively update flag {:?} to {}",
        flag,
        new_value
    ))]
    ControllerFlagUpdateError {
        flag: ControllerFlag,
        new_value: bool,
    },
}

/// Check if a transition exists between two given states.
/// Initial state: New, final state: Unconfigured.
fn check_transition(
    from: NvmeControllerState,
    to: NvmeControllerState,
) -> bool {
    match from {
        New => matches!(to, Initializing),
        Initializing => matches!(to, Running | Faulted(_)),
        Running => matches!(to, Resetting | Unconfiguring | Faulted(_)),
        Resetting => matches!(to, Running | Unconfiguring | Faulted(_)),
        Faulted(_) => {
            matches!(to, Running | Resetting | Unconfiguring | Faulted(_))
        }
        Unconfiguring => matches!(to, Unconfigured | Faulted(_)),
        // Final state, no further transitions possible.
        Unconfigured => false,
    }
}

impl ControllerStateMachine {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            current_state: New,
            flag: AtomicCell::new(false),
        }
    }

    /// Unconditionally transition from the current state to a new state.
    pub fn transition(
        &mut self,
        new_state: NvmeControllerState,
    ) -> Result<(), ControllerStateMachineError> {
        if check_transition(self.current_state, new_state) {
            info!(
                "{} transitioned from state {:?} to {:?}",
                self.name, self.current_state, new_state
            );
            self.current_state = new_state;
            Ok(())
        } else {
            Err(
                ControllerStateMachineError::ControllerStateTransitionError {
                    current_state: self.current_state,
                    new_state,
                },
            )
        }
    }

    /// Transition to a new state only if the current state matches.
    pub fn transition_checked(
        &mut self,
        current_state: NvmeControllerState,
        new_state: NvmeControllerState,
    ) -> Result<(), ControllerStateMachineError> {
        if self.current_state != current_state {
            return Err(
                ControllerStateMachineError::ControllerStateTransitionError {
                    current_state,
                    new_state,
                },
            );
        }
        self.transition(new_state)
    }

    /// Get current state.
    pub fn current_state(&self) -> NvmeControllerState {
        self.current_state
    }

    /// Sets the flag only if it is not set.
    pub fn set_flag_exclusively(
        &self,
        flag: ControllerFlag,
    ) -> Result<(), ControllerStateMachineError> {
        if self.flag.compare_exchange(false, true).is_err() {
            Err(ControllerStateMachineError::ControllerFlagUpdateError {
                flag,
                new_value: true,
            })
        } else {
            Ok(())
        }
    }

    /// Clears the flag only if it is set.
    pub fn clear_flag_exclusively(
        &self,
        flag: ControllerFlag,
    ) -> Result<(), ControllerStateMachineError> {
        if self.flag.compare_exchange(true, false).is_err() {
            Err(ControllerStateMachineError::ControllerFlagUpdateError {
                flag,
                new_value: false,
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let mut sm = ControllerStateMachine::new("ut");
        assert_eq!(sm.current_state(), New);
        sm.transition(Initializing).unwrap();
        sm.transition(Running).unwrap();
        sm.transition(Resetting).unwrap();
        sm.transition(Running).unwrap();
        sm.transition(Unconfiguring).unwrap();
        sm.transition(Unconfigured).unwrap();
        // terminal
        assert!(sm.transition(Running).is_err());
    }

    #[test]
    fn invalid_transitions_rejected() {
        let mut sm = ControllerStateMachine::new("ut");
        assert!(sm.transition(Running).is_err());
        sm.transition(Initializing).unwrap();
        assert!(sm.transition(Resetting).is_err());
    }

    #[test]
    fn reset_flag_is_exclusive() {
        let sm = ControllerStateMachine::new("ut");
        sm.set_flag_exclusively(ControllerFlag::ResetActive).unwrap();
        assert!(sm
            .set_flag_exclusively(ControllerFlag::ResetActive)
            .is_err());
        sm.clear_flag_exclusively(ControllerFlag::ResetActive)
            .unwrap();
        assert!(sm
            .clear_flag_exclusively(ControllerFlag::ResetActive)
            .is_err());
    }
}
