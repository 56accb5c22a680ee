//! Session state machine
//!
//! `Created → AwaitingInputs → Ready → Running → {Completed | Failed}`.
//! A terminal session can start another cycle (`Running`) or take more
//! uploads (`Ready`).

use crate::error::CoreError;
use crate::types::SessionStatus;

/// Validates a session status transition
///
/// # Errors
/// `InvalidTransition` if `to` is not reachable from `from`.
pub fn validate_transition(from: SessionStatus, to: SessionStatus) -> Result<(), CoreError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition(format!("{from:?} -> {to:?}")))
    }
}

/// Statuses reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: SessionStatus) -> &'static [SessionStatus] {
    use SessionStatus::*;
    match from {
        Created => &[AwaitingInputs, Ready],
        AwaitingInputs => &[AwaitingInputs, Ready],
        Ready => &[Ready, Running],
        Running => &[Completed, Failed],
        Completed | Failed => &[Ready, Running],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionStatus::*;

    #[test]
    fn happy_path() {
        for (from, to) in [
            (Created, AwaitingInputs),
            (AwaitingInputs, Ready),
            (Ready, Running),
            (Running, Completed),
        ] {
            assert!(validate_transition(from, to).is_ok(), "{from:?} -> {to:?}");
        }
    }

    #[test]
    fn terminal_states_allow_new_cycle() {
        assert!(validate_transition(Completed, Running).is_ok());
        assert!(validate_transition(Failed, Running).is_ok());
        assert!(validate_transition(Failed, Ready).is_ok());
    }

    #[test]
    fn cannot_skip_inputs() {
        assert!(validate_transition(Created, Running).is_err());
        assert!(validate_transition(AwaitingInputs, Running).is_err());
        assert!(validate_transition(Running, Ready).is_err());
        assert!(validate_transition(Running, Running).is_err());
    }
}
