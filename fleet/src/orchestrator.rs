//! Job orchestration: `start`, `check`, `status`, `restart`, `stop`,
//! `finalize`, `prune` and `preflight`.
//!
//! Every mutating operation takes the per-job lock first, so concurrent calls
//! on one id serialize and at most one agent process group is live per job.
//! State changes go through [`transition`]; the outcome record is written only
//! by finalization and only once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::can_retry;
use crate::core::health::assess;
use crate::core::lifecycle::{JobEvent, transition};
use crate::core::reason::{classify_failure, tail};
use crate::core::types::{HealthState, JobState, ReasonCode};
use crate::error::FleetError;
use crate::io::config::FleetConfig;
use crate::io::job_store::{JobRecord, JobStore, LOG_HEADER_PREFIX, Outcome, RuntimeContract};
use crate::io::lock::{LockGuard, Locks};
use crate::io::process::{group_alive, terminate_group, terminate_pid};
use crate::io::provider::{
    Credential, CredentialResolver, LaunchRequest, Preflight, Provider, ProviderRegistry,
    preflight_check,
};
use crate::io::signals::{collect_sample, worktree_fingerprint};

/// Bytes of log tail scanned when classifying a failed exit.
const REASON_TAIL_BYTES: usize = 16 * 1024;

/// Parameters for `start`.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub id: String,
    pub provider: String,
    pub prompt: String,
    pub worktree: PathBuf,
    pub model: Option<String>,
}

/// What `start` and `restart` hand back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: String,
    pub state: JobState,
    pub pid: Option<u32>,
    pub provider: String,
    pub model: String,
    pub retry_count: u32,
    pub log_path: PathBuf,
}

/// Read-only view returned by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub state: JobState,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub worktree: Option<PathBuf>,
    pub pid: Option<u32>,
    pub alive: bool,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub mutation_count: u64,
    pub exit_code: Option<i32>,
    pub reason: Option<ReasonCode>,
}

/// Validate that an id is safe as a directory and lock-file name.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("job id must not be empty"));
    }
    if id.starts_with('.') {
        return Err(anyhow!("job id must not start with '.'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("job id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

pub struct Orchestrator {
    home: PathBuf,
    config: FleetConfig,
    store: JobStore,
    locks: Locks,
    providers: ProviderRegistry,
    credentials: Arc<dyn CredentialResolver>,
}

impl Orchestrator {
    pub fn new(home: &Path, config: FleetConfig, credentials: Arc<dyn CredentialResolver>) -> Self {
        Self {
            home: home.to_path_buf(),
            store: JobStore::new(home),
            locks: Locks::new(home),
            providers: ProviderRegistry::from_config(&config),
            config,
            credentials,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn locks(&self) -> &Locks {
        &self.locks
    }

    /// Launch a new job. Idempotent: a live job with this id is returned as-is.
    ///
    /// Permission and preflight checks run before anything is written, so a
    /// rejected start leaves no job artifacts behind.
    #[instrument(skip_all, fields(job_id = %request.id, provider = %request.provider))]
    pub fn start(&self, request: &StartRequest) -> Result<JobHandle> {
        let _lock = self.lock_job(&request.id)?;
        let id = request.id.as_str();

        if self.store.exists(id) {
            let record = self.store.load_record(id)?;
            if let Some(outcome) = self.store.load_outcome(id)? {
                return Err(FleetError::JobTerminal {
                    id: id.to_string(),
                    state: outcome.state,
                }
                .into());
            }
            let contract = self.store.load_contract(id)?;
            info!(state = %record.state, "job already exists");
            return Ok(self.handle(&record, &contract));
        }

        let worktree = self.check_worktree(&request.worktree)?;
        let provider = self.providers.get(&request.provider)?;
        let preflight = preflight_check(
            provider,
            request.model.as_deref(),
            &*self.credentials,
        )?;

        let now = Utc::now();
        self.store.create_dir(id)?;
        let prompt_path = self.store.write_prompt(id, &request.prompt)?;
        let contract = RuntimeContract {
            id: id.to_string(),
            provider: preflight.provider.clone(),
            provider_kind: preflight.kind,
            model: preflight.model.clone(),
            credential_source: preflight.credential.as_ref().map(|c| c.source.clone()),
            worktree,
            prompt_path,
            created_at: now,
        };
        self.store.write_contract(&contract)?;
        let mut record = JobRecord::new(id, now);
        self.store.write_record(&record)?;
        info!(model = %contract.model, "job created");

        self.launch_attempt(provider, &contract, preflight.credential, &mut record)
    }

    /// Sample the job's signals and classify it.
    ///
    /// A dead process is finalized immediately with its captured exit code.
    #[instrument(skip_all, fields(job_id = id))]
    pub fn check(&self, id: &str) -> Result<HealthState> {
        let _lock = self.lock_job(id)?;
        let mut record = self.load_record(id)?;
        if let Some(outcome) = self.store.load_outcome(id)? {
            return Ok(HealthState::Terminal(outcome.state));
        }

        let alive = record.pid.is_some_and(group_alive);
        let exit_code = self.store.read_exit_code(id)?;
        if !alive || exit_code.is_some() {
            let outcome = self.finalize_locked(&mut record, None)?;
            debug!(state = %outcome.state, exit_code = ?outcome.exit_code, "process gone");
            return Ok(match outcome.state {
                JobState::Succeeded => HealthState::Terminal(JobState::Succeeded),
                _ => HealthState::Dead,
            });
        }

        let contract = self.store.load_contract(id)?;
        let fingerprint =
            worktree_fingerprint(&contract.worktree, &self.config.jobs.mutation_ignore);
        if let (Some(prev), Some(next)) = (&record.last_fingerprint, &fingerprint)
            && prev != next
        {
            record.mutation_count += 1;
            self.store.write_mutations(id, record.mutation_count)?;
        }
        let mutation_signal = fingerprint.as_ref().map(|_| record.mutation_count);
        if fingerprint.is_some() {
            record.last_fingerprint = fingerprint;
        }

        let sample = collect_sample(&self.store, id, record.pid, mutation_signal);
        let assessment = assess(record.last_sample.as_ref(), &sample, record.flat_streak);
        record.flat_streak = assessment.flat_streak;
        record.last_sample = Some(sample);

        let now = Utc::now();
        if !assessment.progressed.is_empty() {
            record.last_heartbeat_at = Some(now);
            self.store.write_heartbeat(id, now)?;
        }
        let event = if assessment.stalled {
            Some(JobEvent::NoProgress)
        } else if !assessment.progressed.is_empty() {
            Some(JobEvent::Progress)
        } else {
            None
        };
        if let Some(event) = event
            && matches!(record.state, JobState::Running | JobState::Stalled)
        {
            let next = transition(record.state, event)?;
            if next != record.state {
                info!(from = %record.state, to = %next, "job state changed");
            }
            if next == JobState::Running {
                record.next_retry_at = None;
            }
            record.state = next;
        }
        self.store.write_record(&record)?;

        debug!(
            state = %record.state,
            flat_streak = record.flat_streak,
            progressed = ?assessment.progressed,
            "job checked"
        );
        Ok(match record.state {
            JobState::Stalled => HealthState::Stalled,
            _ => HealthState::Healthy,
        })
    }

    /// Read-only summaries for one job or every job.
    pub fn status(&self, id: Option<&str>) -> Result<Vec<JobSummary>> {
        let ids = match id {
            Some(id) => {
                validate_id(id)?;
                if !self.store.exists(id) {
                    return Err(FleetError::JobNotFound { id: id.to_string() }.into());
                }
                vec![id.to_string()]
            }
            None => self.store.list_ids()?,
        };
        ids.iter().map(|id| self.summary(id)).collect()
    }

    fn summary(&self, id: &str) -> Result<JobSummary> {
        let record = self.store.load_record(id)?;
        let contract = self.store.load_contract(id).ok();
        let outcome = self.store.load_outcome(id)?;
        let alive = outcome.is_none() && record.pid.is_some_and(group_alive);
        let (state, exit_code, reason) = match &outcome {
            Some(o) => (o.state, o.exit_code, o.reason),
            None => (record.state, record.exit_code, record.reason),
        };
        Ok(JobSummary {
            id: id.to_string(),
            state,
            provider: contract.as_ref().map(|c| c.provider.clone()),
            model: contract.as_ref().map(|c| c.model.clone()),
            worktree: contract.as_ref().map(|c| c.worktree.clone()),
            pid: record.pid,
            alive,
            retry_count: record.retry_count,
            started_at: record.started_at,
            last_heartbeat_at: record.last_heartbeat_at,
            mutation_count: record.mutation_count,
            exit_code,
            reason,
        })
    }

    /// Terminate the current attempt, rotate its log and relaunch under the
    /// persisted runtime contract.
    ///
    /// An attempt that already exited is finalized instead and the restart
    /// is refused as terminal.
    #[instrument(skip_all, fields(job_id = id))]
    pub fn restart(&self, id: &str) -> Result<JobHandle> {
        let _lock = self.lock_job(id)?;
        let mut record = self.load_record(id)?;
        if let Some(outcome) = self.store.load_outcome(id)? {
            return Err(FleetError::JobTerminal {
                id: id.to_string(),
                state: outcome.state,
            }
            .into());
        }
        let alive = record.pid.is_some_and(group_alive);
        if !alive || self.store.read_exit_code(id)?.is_some() {
            let outcome = self.finalize_locked(&mut record, None)?;
            info!(state = %outcome.state, "attempt already exited; not restarting");
            return Err(FleetError::JobTerminal {
                id: id.to_string(),
                state: outcome.state,
            }
            .into());
        }

        let ceiling = self.config.jobs.retry_ceiling;
        if !can_retry(record.retry_count, ceiling) {
            warn!(retries = record.retry_count, ceiling, "retry ceiling reached");
            self.finalize_locked(&mut record, Some(ReasonCode::RetryExhausted))?;
            return Err(FleetError::RetryExhausted {
                id: id.to_string(),
                retries: record.retry_count,
                ceiling,
            }
            .into());
        }

        let contract = self.store.load_contract(id)?;
        let provider = self.providers.get(&contract.provider)?;
        let credential = contract
            .credential_source
            .as_deref()
            .map(|source| self.credentials.resolve_source(source))
            .transpose()?;

        if let Some(pid) = record.pid {
            terminate_group(pid, self.grace())
                .with_context(|| format!("terminate previous attempt of {id}"))?;
        }
        if record.state != JobState::Restarting {
            record.state = transition(record.state, JobEvent::Restart)?;
        }
        self.store.rotate_log(id)?;
        record.retry_count += 1;
        record.next_retry_at = None;
        self.store.write_record(&record)?;
        info!(retry_count = record.retry_count, "restarting job");

        self.launch_attempt(provider, &contract, credential, &mut record)
    }

    /// Terminate the job and its monitor and record an `aborted` outcome.
    /// A job that is already terminal is left untouched.
    #[instrument(skip_all, fields(job_id = id))]
    pub fn stop(&self, id: &str) -> Result<Outcome> {
        let _lock = self.lock_job(id)?;
        let mut record = self.load_record(id)?;
        if let Some(outcome) = self.store.load_outcome(id)? {
            debug!("job already terminal");
            return Ok(outcome);
        }
        if let Some(monitor) = self.store.read_monitor_pid(id)?
            && monitor != std::process::id()
        {
            terminate_pid(monitor)?;
            self.store.clear_monitor_pid(id)?;
        }
        self.finalize_locked(&mut record, Some(ReasonCode::Stopped))
    }

    /// Force a terminal outcome. Idempotent: an existing outcome is returned unchanged.
    #[instrument(skip_all, fields(job_id = id))]
    pub fn finalize(&self, id: &str, reason: Option<ReasonCode>) -> Result<Outcome> {
        let _lock = self.lock_job(id)?;
        let mut record = self.load_record(id)?;
        if let Some(outcome) = self.store.load_outcome(id)? {
            return Ok(outcome);
        }
        self.finalize_locked(&mut record, reason)
    }

    /// Remove artifacts of terminal jobs finished at least `older_than` before `now`.
    /// Jobs without an outcome record are never touched.
    pub fn prune(&self, older_than: Duration, now: DateTime<Utc>) -> Result<Vec<String>> {
        let cutoff = chrono::Duration::from_std(older_than).context("retention out of range")?;
        let mut removed = Vec::new();
        for id in self.store.list_ids()? {
            let _lock = self.locks.lock_job(&id)?;
            let Some(outcome) = self.store.load_outcome(&id)? else {
                continue;
            };
            if now - outcome.finished_at >= cutoff {
                self.store.remove_job(&id)?;
                removed.push(id);
            }
        }
        Ok(removed)
    }

    /// Run the provider probe, model and credential resolution without creating anything.
    pub fn preflight(&self, provider: &str, model: Option<&str>) -> Result<Preflight> {
        let provider = self.providers.get(provider)?;
        preflight_check(provider, model, &*self.credentials)
    }

    /// Non-terminal job ids.
    pub fn active_ids(&self) -> Result<Vec<String>> {
        let mut active = Vec::new();
        for id in self.store.list_ids()? {
            if self.store.load_outcome(&id)?.is_none() {
                active.push(id);
            }
        }
        Ok(active)
    }

    pub fn record(&self, id: &str) -> Result<JobRecord> {
        self.load_record(id)
    }

    /// Persist the earliest restart time for a stalled job.
    pub fn schedule_retry(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let _lock = self.lock_job(id)?;
        let mut record = self.load_record(id)?;
        if record.state == JobState::Stalled {
            record.next_retry_at = Some(at);
            self.store.write_record(&record)?;
        }
        Ok(())
    }

    fn launch_attempt(
        &self,
        provider: &dyn Provider,
        contract: &RuntimeContract,
        credential: Option<Credential>,
        record: &mut JobRecord,
    ) -> Result<JobHandle> {
        let id = contract.id.as_str();
        let now = Utc::now();
        let paths = self.store.paths(id);
        self.store.clear_exit_code(id)?;
        self.store
            .append_log_header(id, record.retry_count + 1, &contract.model, now)?;

        let request = LaunchRequest {
            job_id: id.to_string(),
            attempt: record.retry_count + 1,
            model: contract.model.clone(),
            worktree: contract.worktree.clone(),
            prompt_path: contract.prompt_path.clone(),
            log_path: paths.log.clone(),
            exit_code_path: paths.exit_code.clone(),
            credential,
        };
        let pid = match provider.launch(&request) {
            Ok(pid) => pid,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "launch failed");
                record.state = transition(record.state, JobEvent::LaunchFailed)?;
                record.reason = Some(ReasonCode::StartFailed);
                self.store.write_record(record)?;
                self.write_outcome(record, None, Some(ReasonCode::StartFailed))?;
                return Err(err.context(format!("launch job {id}")));
            }
        };

        record.state = transition(record.state, JobEvent::Launch)?;
        record.pid = Some(pid);
        record.attempt_started_at = now;
        record.flat_streak = 0;
        record.last_sample = None;
        record.last_fingerprint = None;
        record.last_heartbeat_at = Some(now);
        self.store.write_pid(id, pid)?;
        self.store.write_heartbeat(id, now)?;
        self.store.write_record(record)?;
        info!(pid, attempt = record.retry_count + 1, "job running");
        Ok(self.handle(record, contract))
    }

    /// Terminal transition with the job lock held. Kills any remaining
    /// process group, decides the final state and writes the outcome once.
    fn finalize_locked(&self, record: &mut JobRecord, reason: Option<ReasonCode>) -> Result<Outcome> {
        let id = record.id.clone();
        if let Some(pid) = record.pid
            && group_alive(pid)
        {
            terminate_group(pid, self.grace())
                .with_context(|| format!("terminate job {id}"))?;
        }
        let exit_code = self.store.read_exit_code(&id)?;

        let (event, reason) = match (reason, exit_code) {
            (Some(ReasonCode::Stopped), _) => (JobEvent::Stop, Some(ReasonCode::Stopped)),
            (Some(ReasonCode::RetryExhausted), _) => {
                (JobEvent::RetryExhausted, Some(ReasonCode::RetryExhausted))
            }
            (reason, Some(0)) => (JobEvent::ProcessExit(0), reason),
            (reason, Some(code)) => (
                JobEvent::ProcessExit(code),
                reason.or_else(|| Some(self.exit_reason(&id, code))),
            ),
            (reason, None) => (
                JobEvent::ProcessLost,
                reason.or(Some(ReasonCode::ProcessLost)),
            ),
        };

        let state = if record.state.is_terminal() {
            record.state
        } else {
            transition(record.state, event)?
        };
        record.state = state;
        record.exit_code = exit_code;
        record.reason = reason;
        self.store.write_record(record)?;
        self.write_outcome(record, exit_code, reason)
    }

    fn write_outcome(
        &self,
        record: &JobRecord,
        exit_code: Option<i32>,
        reason: Option<ReasonCode>,
    ) -> Result<Outcome> {
        let contract = self.store.load_contract(&record.id).ok();
        let finished_at = Utc::now();
        let outcome = Outcome {
            id: record.id.clone(),
            state: record.state,
            exit_code,
            reason,
            started_at: record.started_at,
            finished_at,
            duration_ms: (finished_at - record.started_at).num_milliseconds(),
            retry_count: record.retry_count,
            provider: contract.as_ref().map(|c| c.provider.clone()),
            model: contract.map(|c| c.model),
        };
        self.store.write_outcome_once(&outcome)
    }

    fn exit_reason(&self, id: &str, code: i32) -> ReasonCode {
        // 126/127: the shell could not execute the agent binary.
        if code == 126 || code == 127 {
            return ReasonCode::StartFailed;
        }
        // 124: killed by a `timeout` wrapper in the agent command.
        if code == 124 {
            return ReasonCode::WaitTimeout;
        }
        match self.store.log_tail(id, REASON_TAIL_BYTES) {
            Ok(log) => {
                let output: String = log
                    .lines()
                    .filter(|line| !line.starts_with(LOG_HEADER_PREFIX))
                    .collect::<Vec<_>>()
                    .join("\n");
                classify_failure(tail(&output, REASON_TAIL_BYTES))
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "cannot read log for classification");
                ReasonCode::ExecutorException
            }
        }
    }

    /// Canonicalize `worktree` and require it strictly inside the scratch root.
    fn check_worktree(&self, worktree: &Path) -> Result<PathBuf> {
        let root = self.config.scratch_root(&self.home);
        let denied = || FleetError::Permission {
            path: worktree.to_path_buf(),
            root: root.clone(),
        };
        let Ok(canonical_root) = root.canonicalize() else {
            return Err(denied().into());
        };
        let Ok(canonical) = worktree.canonicalize() else {
            return Err(denied().into());
        };
        if canonical == canonical_root || !canonical.starts_with(&canonical_root) {
            return Err(denied().into());
        }
        Ok(canonical)
    }

    /// Validate `id` before it names any path, then take its job lock.
    fn lock_job(&self, id: &str) -> Result<LockGuard> {
        validate_id(id)?;
        self.locks.lock_job(id)
    }

    fn load_record(&self, id: &str) -> Result<JobRecord> {
        validate_id(id)?;
        if !self.store.exists(id) {
            return Err(FleetError::JobNotFound { id: id.to_string() }.into());
        }
        self.store.load_record(id)
    }

    fn handle(&self, record: &JobRecord, contract: &RuntimeContract) -> JobHandle {
        JobHandle {
            id: record.id.clone(),
            state: record.state,
            pid: record.pid,
            provider: contract.provider.clone(),
            model: contract.model.clone(),
            retry_count: record.retry_count,
            log_path: self.store.paths(&record.id).log,
        }
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.config.jobs.stop_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_id_rejects_path_tricks() {
        assert!(validate_id("PROJ-123").is_ok());
        assert!(validate_id("a.b_c-d").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("../etc").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id(".hidden").is_err());
    }
}
