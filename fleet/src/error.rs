//! Typed errors that commands surface as stable exit codes.
//!
//! Functions return `anyhow::Result`; these variants ride inside `anyhow::Error`
//! and are recovered at the CLI boundary with `downcast_ref`.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::types::{HealthState, JobState, ReasonCode};
use crate::exit_codes;

#[derive(Debug, Error)]
pub enum FleetError {
    /// Credentials, model or provider binary unavailable. No job is created.
    #[error("preflight failed ({reason}): {message}")]
    Preflight { reason: ReasonCode, message: String },

    /// Worktree path is not inside the scratch root.
    #[error("worktree {} is outside the scratch root {}", path.display(), root.display())]
    Permission { path: PathBuf, root: PathBuf },

    #[error("job {id} made no progress across consecutive checks")]
    StallTimeout { id: String },

    #[error("job {id} exhausted its retries ({retries}/{ceiling})")]
    RetryExhausted {
        id: String,
        retries: u32,
        ceiling: u32,
    },

    /// The job ended without succeeding. `code` is `None` when it was stopped
    /// or its process vanished without recording one.
    #[error("job {id} did not succeed (exit code {})", code_label(*code))]
    ProcessExit { id: String, code: Option<i32> },

    /// Push did not succeed; nothing destructive was done.
    #[error("push of {branch} failed: {message}")]
    PushFailure { branch: String, message: String },

    /// A git operation lock, active session or another fleet process holds the resource.
    #[error("skipped: {what} is locked")]
    LockContention { what: String },

    #[error("no job with id {id}")]
    JobNotFound { id: String },

    #[error("job {id} is already terminal ({state})")]
    JobTerminal { id: String, state: JobState },
}

impl FleetError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Preflight { .. } => exit_codes::PREFLIGHT,
            Self::Permission { .. } => exit_codes::PERMISSION,
            Self::StallTimeout { .. } => exit_codes::STALLED,
            Self::RetryExhausted { .. } => exit_codes::RETRY_EXHAUSTED,
            Self::ProcessExit { .. } => exit_codes::FAILED,
            Self::PushFailure { .. } => exit_codes::PUSH_FAILURE,
            Self::LockContention { .. } => exit_codes::LOCK_CONTENTION,
            Self::JobNotFound { .. } | Self::JobTerminal { .. } => exit_codes::INVALID,
        }
    }
}

impl FleetError {
    /// The error `fleet check` reports for an observed health, if any.
    /// Healthy and succeeded jobs have none.
    pub fn from_health(id: &str, health: HealthState, exit_code: Option<i32>) -> Option<Self> {
        match health {
            HealthState::Healthy | HealthState::Terminal(JobState::Succeeded) => None,
            HealthState::Stalled => Some(Self::StallTimeout { id: id.to_string() }),
            HealthState::Dead | HealthState::Terminal(_) => Some(Self::ProcessExit {
                id: id.to_string(),
                code: exit_code,
            }),
        }
    }
}

fn code_label(code: Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

/// Map any command error to its exit code.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<FleetError>()
        .map_or(exit_codes::INVALID, FleetError::exit_code)
}
