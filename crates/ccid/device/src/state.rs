//! Device lifecycle state machine
//!
//! The machine only decides whether a transition is legal and what it implies;
//! [`Device`](crate::Device) applies the side effects (registry, events, auto-connect).

use tracing::{debug, warn};

/// Lifecycle state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum State {
    /// No transport connection
    Closed,
    /// Transport connected, bring-up running
    Creating,
    /// Ready for a command
    Idle,
    /// Device in low power mode
    Sleeping,
    /// Wake up requested, waiting for the device
    WakingUp,
    /// One command sent, waiting for its response
    #[display("WritingCmdAndWaitingResp")]
    WritingCmdAndWaitingResp,
    /// Transport being torn down
    Closing,
}

/// Side effect the device has to apply after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Nothing to report
    None,
    /// Bring-up finished: register the device and report it created
    Created,
    /// Left or entered low power mode
    PowerState,
    /// The connection is being torn down because of an error
    DeviceError,
    /// Final state reached: unregister the device and report it closed
    Closed {
        /// Whether the device ever reached `Idle`
        created: bool,
    },
}

/// An accepted transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Previous state
    pub from: State,
    /// New state
    pub to: State,
    /// What the device must do about it
    pub effect: Effect,
}

/// A transition outside the allowed table
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transition {from} -> {to} is not allowed")]
pub struct InvalidTransition {
    /// State the machine stayed in
    pub from: State,
    /// Requested state
    pub to: State,
}

/// Whether `from -> to` is part of the transition table
pub const fn is_allowed(from: State, to: State) -> bool {
    use State::*;
    match to {
        Closed => matches!(from, Closing),
        Creating => matches!(from, Closed),
        Idle => matches!(
            from,
            Idle | Creating | Sleeping | WakingUp | WritingCmdAndWaitingResp
        ),
        Sleeping => matches!(from, Idle | WakingUp),
        WakingUp => matches!(from, Sleeping),
        WritingCmdAndWaitingResp => matches!(from, Idle),
        Closing => matches!(
            from,
            Idle | Creating | Sleeping | WakingUp | WritingCmdAndWaitingResp
        ),
    }
}

/// Lifecycle state plus the exclusive execution token
///
/// The token is taken when entering `Creating`, `WakingUp` or
/// `WritingCmdAndWaitingResp` and given back when `Idle`, `Sleeping` or `Closed` is reached.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: State,
    exclusive: bool,
    created: bool,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// A machine in the `Closed` state
    pub const fn new() -> Self {
        Self {
            state: State::Closed,
            exclusive: false,
            created: false,
        }
    }

    /// Current state
    pub const fn state(&self) -> State {
        self.state
    }

    /// Whether the exclusive token is held
    pub const fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Whether the device reached `Idle` since it was last closed
    pub const fn is_created(&self) -> bool {
        self.created
    }

    /// Move to `to`, or stay put and report the rejected transition
    pub fn transition(&mut self, to: State) -> Result<Transition, InvalidTransition> {
        let from = self.state;
        if !is_allowed(from, to) {
            warn!(%from, %to, "transition should not happen, staying in {from}");
            return Err(InvalidTransition { from, to });
        }
        debug!(%from, %to, "state transition");
        self.state = to;

        match to {
            State::Creating | State::WakingUp | State::WritingCmdAndWaitingResp => {
                self.exclusive = true
            }
            State::Idle | State::Sleeping | State::Closed => self.exclusive = false,
            State::Closing => {}
        }

        let effect = match (from, to) {
            (State::Creating, State::Idle) => {
                self.created = true;
                Effect::Created
            }
            (State::Sleeping | State::WakingUp, State::Idle) => Effect::PowerState,
            (State::Idle, State::Sleeping) => Effect::PowerState,
            (
                State::Creating
                | State::WritingCmdAndWaitingResp
                | State::WakingUp
                | State::Sleeping,
                State::Closing,
            ) => Effect::DeviceError,
            (State::Closing, State::Closed) => {
                let created = self.created;
                self.created = false;
                Effect::Closed { created }
            }
            _ => Effect::None,
        };

        Ok(Transition { from, to, effect })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [State; 7] = [
        State::Closed,
        State::Creating,
        State::Idle,
        State::Sleeping,
        State::WakingUp,
        State::WritingCmdAndWaitingResp,
        State::Closing,
    ];

    fn machine_in(path: &[State]) -> StateMachine {
        let mut machine = StateMachine::new();
        for &state in path {
            machine.transition(state).unwrap();
        }
        machine
    }

    #[test]
    fn test_invalid_transition_is_reverted() {
        let mut machine = StateMachine::new();
        let err = machine.transition(State::Idle).unwrap_err();
        assert_eq!(
            err,
            InvalidTransition {
                from: State::Closed,
                to: State::Idle
            }
        );
        assert_eq!(machine.state(), State::Closed);
    }

    #[test]
    fn test_only_closing_leads_to_closed() {
        for from in ALL {
            assert_eq!(is_allowed(from, State::Closed), from == State::Closing);
        }
    }

    #[test]
    fn test_writing_only_from_idle() {
        for from in ALL {
            assert_eq!(
                is_allowed(from, State::WritingCmdAndWaitingResp),
                from == State::Idle
            );
        }
    }

    #[test]
    fn test_bring_up_effects() {
        let mut machine = StateMachine::new();
        let creating = machine.transition(State::Creating).unwrap();
        assert_eq!(creating.effect, Effect::None);
        assert!(machine.is_exclusive());

        let idle = machine.transition(State::Idle).unwrap();
        assert_eq!(idle.effect, Effect::Created);
        assert!(!machine.is_exclusive());
        assert!(machine.is_created());
    }

    #[test]
    fn test_command_cycle_takes_token() {
        let mut machine = machine_in(&[State::Creating, State::Idle]);
        machine.transition(State::WritingCmdAndWaitingResp).unwrap();
        assert!(machine.is_exclusive());
        let back = machine.transition(State::Idle).unwrap();
        assert_eq!(back.effect, Effect::None);
        assert!(!machine.is_exclusive());
    }

    #[test]
    fn test_closing_effects() {
        let mut machine = machine_in(&[State::Creating]);
        assert_eq!(
            machine.transition(State::Closing).unwrap().effect,
            Effect::DeviceError
        );
        assert_eq!(
            machine.transition(State::Closed).unwrap().effect,
            Effect::Closed { created: false }
        );

        let mut machine = machine_in(&[State::Creating, State::Idle]);
        assert_eq!(
            machine.transition(State::Closing).unwrap().effect,
            Effect::None
        );
        assert_eq!(
            machine.transition(State::Closed).unwrap().effect,
            Effect::Closed { created: true }
        );
        assert!(!machine.is_created());
    }

    #[test]
    fn test_sleep_cycle() {
        let mut machine = machine_in(&[State::Creating, State::Idle]);
        assert_eq!(
            machine.transition(State::Sleeping).unwrap().effect,
            Effect::PowerState
        );
        machine.transition(State::WakingUp).unwrap();
        assert!(machine.is_exclusive());
        // wake up failed, back to sleep
        machine.transition(State::Sleeping).unwrap();
        assert!(!machine.is_exclusive());
        machine.transition(State::WakingUp).unwrap();
        assert_eq!(
            machine.transition(State::Idle).unwrap().effect,
            Effect::PowerState
        );
    }
}
