//! Refill acknowledgment state machine.
//!
//! ```text
//!              Acknowledge / Toggle
//!   Active  ------------------------>  Acknowledged
//!     ^  ^    Reopen / Toggle             |
//!     |  +--------------------------------+
//!     |        ScheduleChanged (any state)
//!     +-----------------------------------
//! ```
//!
//! The machine is pure. It reports the side effect a transition calls for and
//! leaves carrying it out against the dispatcher to the coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Refill status of the current supply cycle
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RefillState {
    /// Awaiting a refill, reminders are live
    #[default]
    Active,
    /// Marked as refilled, reminders for this cycle are suppressed
    Acknowledged,
}

impl RefillState {
    pub fn from_status(refilled: bool) -> Self {
        if refilled {
            RefillState::Acknowledged
        } else {
            RefillState::Active
        }
    }

    pub fn reminders_live(self) -> bool {
        self == RefillState::Active
    }
}

impl fmt::Display for RefillState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefillState::Active => f.write_str("awaiting refill"),
            RefillState::Acknowledged => f.write_str("refilled"),
        }
    }
}

/// Inputs to the state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefillEvent {
    /// User marked the prescription as refilled
    Acknowledge,
    /// User took the refilled mark back
    Reopen,
    /// The refill button: flips between the two states
    Toggle,
    /// Dosage, supply, start or reminder preferences were edited
    ScheduleChanged,
}

/// What the coordinator must do with the dispatcher after a transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefillEffect {
    None,
    /// Cancel every not-yet-fired reminder of the current cycle
    CancelPending,
    /// Register the already computed plan again
    RegisterPlan,
    /// Cancel the old cycle, then register a freshly computed plan
    Regenerate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: RefillState,
    pub to: RefillState,
    pub effect: RefillEffect,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Apply `event` to `state`
pub fn transition(state: RefillState, event: RefillEvent) -> Transition {
    use RefillState::*;

    let (to, effect) = match (state, event) {
        (_, RefillEvent::ScheduleChanged) => (Active, RefillEffect::Regenerate),
        (Active, RefillEvent::Acknowledge) | (Active, RefillEvent::Toggle) => {
            (Acknowledged, RefillEffect::CancelPending)
        }
        (Acknowledged, RefillEvent::Reopen) | (Acknowledged, RefillEvent::Toggle) => {
            (Active, RefillEffect::RegisterPlan)
        }
        // Repeating the current state is a no-op.
        (Acknowledged, RefillEvent::Acknowledge) => (Acknowledged, RefillEffect::None),
        (Active, RefillEvent::Reopen) => (Active, RefillEffect::None),
    };

    tracing::debug!("Refill transition {:?} --{:?}--> {:?} ({:?})", state, event, to, effect);

    Transition {
        from: state,
        to,
        effect,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_active() {
        assert_eq!(RefillState::default(), RefillState::Active);
        assert!(RefillState::default().reminders_live());
    }

    #[test]
    fn test_acknowledge_cancels_pending() {
        let t = transition(RefillState::Active, RefillEvent::Acknowledge);
        assert_eq!(t.to, RefillState::Acknowledged);
        assert_eq!(t.effect, RefillEffect::CancelPending);
        assert!(t.changed());
    }

    #[test]
    fn test_toggle_round_trip() {
        let first = transition(RefillState::Active, RefillEvent::Toggle);
        assert_eq!(first.to, RefillState::Acknowledged);
        assert_eq!(first.effect, RefillEffect::CancelPending);

        let second = transition(first.to, RefillEvent::Toggle);
        assert_eq!(second.to, RefillState::Active);
        assert_eq!(second.effect, RefillEffect::RegisterPlan);
    }

    #[test]
    fn test_schedule_change_always_resets() {
        for state in [RefillState::Active, RefillState::Acknowledged] {
            let t = transition(state, RefillEvent::ScheduleChanged);
            assert_eq!(t.to, RefillState::Active);
            assert_eq!(t.effect, RefillEffect::Regenerate);
        }
    }

    #[test]
    fn test_repeated_events_are_noops() {
        let t = transition(RefillState::Acknowledged, RefillEvent::Acknowledge);
        assert_eq!(t.effect, RefillEffect::None);
        assert!(!t.changed());

        let t = transition(RefillState::Active, RefillEvent::Reopen);
        assert_eq!(t.effect, RefillEffect::None);
        assert!(!t.changed());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(RefillState::from_status(true), RefillState::Acknowledged);
        assert_eq!(RefillState::from_status(false), RefillState::Active);
        assert!(!RefillState::Acknowledged.reminders_live());
    }
}
