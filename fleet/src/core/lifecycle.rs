//! Job lifecycle state machine.
//!
//! ```text
//! pending    -[launch]-------------> running
//! running    -[progress]-----------> running
//! running    -[no-progress x2]-----> stalled
//! stalled    -[progress]-----------> running
//! running|stalled -[restart]-------> restarting -[launch]-> running
//! pending|restarting -[launch-failed]-> failed
//! *          -[retry-exhausted]----> failed
//! *          -[process-exit(0)]----> succeeded
//! *          -[process-exit(!=0)]--> failed
//! *          -[stop]---------------> aborted
//! ```
//!
//! `*` is any non-terminal state. Terminal states reject every event.

use thiserror::Error;

use crate::core::types::JobState;

/// Events that drive job state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Launch,
    LaunchFailed,
    Progress,
    NoProgress,
    Restart,
    RetryExhausted,
    ProcessExit(i32),
    /// Process vanished without a captured exit status.
    ProcessLost,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job is terminal ({0}); no further transitions")]
    Terminal(JobState),
    #[error("invalid transition from {from} on {event:?}")]
    Invalid { from: JobState, event: JobEvent },
}

/// Compute the next state for `event`, or reject the transition.
pub fn transition(from: JobState, event: JobEvent) -> Result<JobState, TransitionError> {
    use JobState::{Aborted, Failed, Pending, Restarting, Running, Stalled, Succeeded};

    if from.is_terminal() {
        return Err(TransitionError::Terminal(from));
    }
    let next = match (from, event) {
        (Pending | Restarting, JobEvent::Launch) => Running,
        (Pending | Restarting, JobEvent::LaunchFailed) => Failed,
        (Running | Stalled, JobEvent::Progress) => Running,
        (Running | Stalled, JobEvent::NoProgress) => Stalled,
        (Running | Stalled, JobEvent::Restart) => Restarting,
        (_, JobEvent::RetryExhausted) => Failed,
        (_, JobEvent::ProcessExit(0)) => Succeeded,
        (_, JobEvent::ProcessExit(_)) => Failed,
        (_, JobEvent::ProcessLost) => Failed,
        (_, JobEvent::Stop) => Aborted,
        (from, event) => return Err(TransitionError::Invalid { from, event }),
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_moves_pending_to_running() {
        assert_eq!(
            transition(JobState::Pending, JobEvent::Launch),
            Ok(JobState::Running)
        );
    }

    #[test]
    fn two_strike_stall_then_restart_then_running() {
        let stalled = transition(JobState::Running, JobEvent::NoProgress).expect("stall");
        assert_eq!(stalled, JobState::Stalled);
        let restarting = transition(stalled, JobEvent::Restart).expect("restart");
        assert_eq!(restarting, JobState::Restarting);
        assert_eq!(
            transition(restarting, JobEvent::Launch),
            Ok(JobState::Running)
        );
    }

    #[test]
    fn stalled_job_recovers_on_progress() {
        assert_eq!(
            transition(JobState::Stalled, JobEvent::Progress),
            Ok(JobState::Running)
        );
    }

    #[test]
    fn exit_code_decides_success() {
        assert_eq!(
            transition(JobState::Running, JobEvent::ProcessExit(0)),
            Ok(JobState::Succeeded)
        );
        assert_eq!(
            transition(JobState::Running, JobEvent::ProcessExit(17)),
            Ok(JobState::Failed)
        );
    }

    #[test]
    fn stop_aborts_any_live_state() {
        for state in [
            JobState::Pending,
            JobState::Running,
            JobState::Stalled,
            JobState::Restarting,
        ] {
            assert_eq!(transition(state, JobEvent::Stop), Ok(JobState::Aborted));
        }
    }

    #[test]
    fn terminal_states_are_immutable() {
        for state in [JobState::Succeeded, JobState::Failed, JobState::Aborted] {
            assert_eq!(
                transition(state, JobEvent::Stop),
                Err(TransitionError::Terminal(state))
            );
            assert_eq!(
                transition(state, JobEvent::Launch),
                Err(TransitionError::Terminal(state))
            );
        }
    }

    #[test]
    fn pending_cannot_stall() {
        assert!(matches!(
            transition(JobState::Pending, JobEvent::NoProgress),
            Err(TransitionError::Invalid { .. })
        ));
    }
}
