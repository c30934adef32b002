//! The job lifecycle state machine.

use crate::errors::TransitionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a job.
///
/// `Waiting` is the only claimable state. Every other state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be claimed once `scheduled_for` has passed.
    Waiting,
    /// Completed successfully.
    Finished,
    /// Exhausted its attempts.
    Failed,
    /// Removed from the queue. Never persisted, the row is deleted instead.
    Destroyed,
}

impl JobState {
    /// String form, as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Destroyed => "destroyed",
        }
    }

    /// Whether no transition may leave this state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Waiting)
    }

    /// Validate a transition from `self` to `next`.
    ///
    /// Only `Waiting` may transition, and it may go anywhere, including back
    /// to `Waiting` (reschedule, non-terminal failure).
    pub fn transition(self, next: JobState) -> Result<JobState, TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError {
                from: self,
                to: next,
            });
        }
        Ok(next)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_can_go_anywhere() {
        for next in [
            JobState::Waiting,
            JobState::Finished,
            JobState::Failed,
            JobState::Destroyed,
        ] {
            assert_eq!(JobState::Waiting.transition(next), Ok(next));
        }
    }

    #[test]
    fn terminal_states_reject_transitions() {
        for from in [JobState::Finished, JobState::Failed, JobState::Destroyed] {
            assert!(from.is_terminal());
            let err = from.transition(JobState::Waiting).unwrap_err();
            assert_eq!(err.from, from);
            assert_eq!(err.to, JobState::Waiting);
        }
    }

    #[test]
    fn display_matches_stored_form() {
        assert_eq!(JobState::Failed.to_string(), "failed");
        assert_eq!(
            serde_json::to_string(&JobState::Finished).unwrap(),
            "\"finished\""
        );
    }
}
