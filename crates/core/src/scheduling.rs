//! Job status state machine.
//!
//! Lives in `core` (zero internal deps) so both the engine and any
//! future tooling validate transitions the same way.

use crate::error::CoreError;
use crate::types::JobStatus;

/// Returns the set of valid target statuses reachable from `from`.
///
/// Terminal states return an empty slice because no further transitions
/// are allowed.
pub fn valid_transitions(from: JobStatus) -> &'static [JobStatus] {
    use JobStatus::*;
    match from {
        Queued => &[Running, Failed, Cancelled],
        Running => &[Completed, Failed, Cancelled],
        Completed | Failed | Cancelled => &[],
    }
}

/// Check whether a transition from `from` to `to` is valid.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    valid_transitions(from).contains(&to)
}

/// Validate a state transition, returning a typed error for invalid ones.
pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), CoreError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.name(),
            to: to.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    // -----------------------------------------------------------------------
    // Valid transitions
    // -----------------------------------------------------------------------

    #[test]
    fn queued_to_running() {
        assert!(can_transition(Queued, Running));
    }

    #[test]
    fn queued_to_failed() {
        // Admission rejection fails a job without ever running it.
        assert!(can_transition(Queued, Failed));
    }

    #[test]
    fn queued_to_cancelled() {
        assert!(can_transition(Queued, Cancelled));
    }

    #[test]
    fn running_to_completed() {
        assert!(can_transition(Running, Completed));
    }

    #[test]
    fn running_to_failed() {
        assert!(can_transition(Running, Failed));
    }

    #[test]
    fn running_to_cancelled() {
        assert!(can_transition(Running, Cancelled));
    }

    // -----------------------------------------------------------------------
    // Terminal states have no outgoing transitions
    // -----------------------------------------------------------------------

    #[test]
    fn terminal_states_have_no_transitions() {
        assert!(valid_transitions(Completed).is_empty());
        assert!(valid_transitions(Failed).is_empty());
        assert!(valid_transitions(Cancelled).is_empty());
    }

    // -----------------------------------------------------------------------
    // Invalid transitions
    // -----------------------------------------------------------------------

    #[test]
    fn completed_to_running_invalid() {
        assert!(!can_transition(Completed, Running));
    }

    #[test]
    fn queued_to_completed_invalid() {
        assert!(!can_transition(Queued, Completed));
    }

    #[test]
    fn validate_transition_err_names_both_states() {
        use assert_matches::assert_matches;

        let err = validate_transition(Completed, Running).unwrap_err();
        assert_matches!(
            err,
            crate::error::CoreError::InvalidTransition {
                from: "COMPLETED",
                to: "RUNNING",
            }
        );
    }
}
