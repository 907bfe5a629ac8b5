//! Outcome aggregation for `fleet report`.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;

use crate::core::summary::{Summary, SummaryItem};
use crate::core::types::JobState;
use crate::io::job_store::Outcome;
use crate::orchestrator::{JobSummary, Orchestrator};

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub finished: usize,
    pub by_state: BTreeMap<String, usize>,
    pub by_reason: BTreeMap<String, usize>,
    pub active: Vec<JobSummary>,
    pub summary: Summary,
}

/// Read every outcome record plus the live jobs. Read-only.
pub fn build_report(orchestrator: &Orchestrator) -> Result<Report> {
    let store = orchestrator.store();
    let mut outcomes = Vec::new();
    for id in store.list_ids()? {
        if let Some(outcome) = store.load_outcome(&id)? {
            outcomes.push(outcome);
        }
    }
    let active = orchestrator
        .status(None)?
        .into_iter()
        .filter(|job| !job.state.is_terminal())
        .collect();
    Ok(aggregate(&outcomes, active))
}

/// Group outcomes by final state and reason code. Failed jobs and stalled or
/// orphaned live jobs become exceptions.
pub fn aggregate(outcomes: &[Outcome], active: Vec<JobSummary>) -> Report {
    let mut by_state = BTreeMap::new();
    let mut by_reason = BTreeMap::new();
    let mut summary = Summary::new("jobs");

    for outcome in outcomes {
        *by_state.entry(outcome.state.to_string()).or_insert(0) += 1;
        if let Some(reason) = outcome.reason {
            *by_reason.entry(reason.to_string()).or_insert(0) += 1;
        }
        summary.count(outcome.state.as_str());
        if outcome.state == JobState::Failed {
            let reason = outcome
                .reason
                .map_or_else(|| "unknown".to_string(), |r| r.to_string());
            let exit = outcome
                .exit_code
                .map_or_else(String::new, |code| format!(", exit {code}"));
            summary.push(SummaryItem::new(
                "failed",
                outcome.id.clone(),
                format!("{reason}{exit} after {} retries", outcome.retry_count),
            ));
        }
    }

    for job in &active {
        summary.count(job.state.as_str());
        if job.state == JobState::Stalled {
            summary.push(SummaryItem::new(
                "stalled",
                job.id.clone(),
                format!("retry {}", job.retry_count),
            ));
        } else if !job.alive {
            summary.push(SummaryItem::new(
                "orphaned",
                job.id.clone(),
                format!("{} with no live process; run finalize", job.state),
            ));
        }
    }

    Report {
        finished: outcomes.len(),
        by_state,
        by_reason,
        active,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ReasonCode;
    use chrono::Utc;

    fn outcome(id: &str, state: JobState, reason: Option<ReasonCode>) -> Outcome {
        let now = Utc::now();
        Outcome {
            id: id.to_string(),
            state,
            exit_code: match state {
                JobState::Succeeded => Some(0),
                JobState::Failed => Some(1),
                _ => None,
            },
            reason,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            retry_count: 0,
            provider: Some("claude".to_string()),
            model: Some("claude-sonnet-4-5".to_string()),
        }
    }

    #[test]
    fn groups_outcomes_by_state_and_reason() {
        let outcomes = vec![
            outcome("a", JobState::Succeeded, None),
            outcome("b", JobState::Failed, Some(ReasonCode::AuthError)),
            outcome("c", JobState::Failed, Some(ReasonCode::AuthError)),
            outcome("d", JobState::Aborted, Some(ReasonCode::Stopped)),
        ];
        let report = aggregate(&outcomes, Vec::new());
        assert_eq!(report.finished, 4);
        assert_eq!(report.by_state.get("failed"), Some(&2));
        assert_eq!(report.by_reason.get("auth_error"), Some(&2));
        assert_eq!(report.by_reason.get("stopped"), Some(&1));
        assert_eq!(report.summary.exceptions.len(), 2);
    }

    #[test]
    fn all_succeeded_is_all_clear() {
        let outcomes = vec![outcome("a", JobState::Succeeded, None)];
        let report = aggregate(&outcomes, Vec::new());
        assert_eq!(
            report.summary.render(5),
            "jobs: all clear (succeeded=1)"
        );
    }
}
