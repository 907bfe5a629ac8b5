//! Shared deterministic types for fleet core logic.
//!
//! These types define stable contracts between the orchestrator, the health
//! monitor and the on-disk job artifacts. Serialized names are part of the
//! artifact format and must not change.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Stalled,
    Restarting,
    Succeeded,
    Failed,
    Aborted,
}

impl JobState {
    /// `succeeded`, `failed` and `aborted` are terminal and immutable.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stalled => "stalled",
            Self::Restarting => "restarting",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure-reason taxonomy shared by providers, outcome records and reports.
///
/// The first six codes are reported by provider adapters; the rest are
/// assigned by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    ModelUnavailable,
    AuthError,
    PermissionDenied,
    StartFailed,
    WaitTimeout,
    ExecutorException,
    Stopped,
    RetryExhausted,
    ProcessLost,
}

impl ReasonCode {
    pub const ALL: [ReasonCode; 9] = [
        Self::ModelUnavailable,
        Self::AuthError,
        Self::PermissionDenied,
        Self::StartFailed,
        Self::WaitTimeout,
        Self::ExecutorException,
        Self::Stopped,
        Self::RetryExhausted,
        Self::ProcessLost,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModelUnavailable => "model_unavailable",
            Self::AuthError => "auth_error",
            Self::PermissionDenied => "permission_denied",
            Self::StartFailed => "start_failed",
            Self::WaitTimeout => "wait_timeout",
            Self::ExecutorException => "executor_exception",
            Self::Stopped => "stopped",
            Self::RetryExhausted => "retry_exhausted",
            Self::ProcessLost => "process_lost",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasonCode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| anyhow!("unknown reason code '{s}'"))
    }
}

/// Result of `check` for a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "health", content = "state")]
pub enum HealthState {
    /// At least one progress signal advanced recently.
    Healthy,
    /// All signals flat across two consecutive polls.
    Stalled,
    /// The process is gone and did not exit successfully.
    Dead,
    /// The job already has an outcome record.
    Terminal(JobState),
}

impl HealthState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Stalled => "stalled",
            Self::Dead => "dead",
            Self::Terminal(_) => "terminal",
        }
    }
}

/// Source of a heartbeat signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalSource {
    LogActivity,
    ProcessCpuTime,
    WorktreeMutation,
}

impl SignalSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LogActivity => "log-activity",
            Self::ProcessCpuTime => "process-cpu-time",
            Self::WorktreeMutation => "worktree-mutation",
        }
    }
}
