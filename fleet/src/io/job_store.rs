//! Durable per-job artifacts under `<home>/jobs/<id>/`.
//!
//! ```text
//! jobs/<id>/
//!   meta.json      runtime contract (written at start, reused by restart)
//!   state.json     mutable job record (atomic temp + rename)
//!   prompt.md      prompt fed to the agent on stdin
//!   pid            process-group id of the current attempt
//!   job.log        current attempt output; job.log.1, job.log.2, ... are prior attempts
//!   heartbeat      RFC 3339 time of the last observed progress
//!   mutations      worktree mutation counter
//!   exit_code      written by the launch wrapper when the agent exits
//!   monitor.pid    pid of a per-job watchdog, if any
//!   outcome.json   immutable terminal record, written exactly once
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::health::Sample;
use crate::core::types::{JobState, ReasonCode};
use crate::io::config::ProviderKind;
use crate::io::fsutil::{read_json, temp_sibling, write_atomic, write_json_atomic};

/// Start of the header line written before every attempt's output.
pub const LOG_HEADER_PREFIX: &str = "=== fleet job ";

/// Resolved launch parameters. Restart reuses these instead of re-resolving,
/// so a job never drifts to a different model or credential source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeContract {
    pub id: String,
    pub provider: String,
    pub provider_kind: ProviderKind,
    pub model: String,
    /// Where the credential came from (e.g. `env:ANTHROPIC_API_KEY`); never the secret.
    pub credential_source: Option<String>,
    pub worktree: PathBuf,
    pub prompt_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Mutable job bookkeeping (`state.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub state: JobState,
    pub pid: Option<u32>,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub attempt_started_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub mutation_count: u64,
    /// Consecutive flat polls observed so far.
    pub flat_streak: u32,
    pub last_sample: Option<Sample>,
    pub last_fingerprint: Option<String>,
    /// Earliest time the watchdog may restart a stalled job.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub reason: Option<ReasonCode>,
}

impl JobRecord {
    pub fn new(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            state: JobState::Pending,
            pid: None,
            retry_count: 0,
            started_at: now,
            attempt_started_at: now,
            last_heartbeat_at: None,
            mutation_count: 0,
            flat_streak: 0,
            last_sample: None,
            last_fingerprint: None,
            next_retry_at: None,
            exit_code: None,
            reason: None,
        }
    }
}

/// Immutable terminal record (`outcome.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub id: String,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub reason: Option<ReasonCode>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub retry_count: u32,
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// Artifact paths for one job.
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub dir: PathBuf,
    pub meta: PathBuf,
    pub state: PathBuf,
    pub prompt: PathBuf,
    pub pid: PathBuf,
    pub log: PathBuf,
    pub heartbeat: PathBuf,
    pub mutations: PathBuf,
    pub exit_code: PathBuf,
    pub monitor_pid: PathBuf,
    pub outcome: PathBuf,
}

impl JobPaths {
    fn new(dir: PathBuf) -> Self {
        Self {
            meta: dir.join("meta.json"),
            state: dir.join("state.json"),
            prompt: dir.join("prompt.md"),
            pid: dir.join("pid"),
            log: dir.join("job.log"),
            heartbeat: dir.join("heartbeat"),
            mutations: dir.join("mutations"),
            exit_code: dir.join("exit_code"),
            monitor_pid: dir.join("monitor.pid"),
            outcome: dir.join("outcome.json"),
            dir,
        }
    }

    /// Path of the `n`th rotated log.
    pub fn rotated_log(&self, n: u32) -> PathBuf {
        self.dir.join(format!("job.log.{n}"))
    }
}

/// Filesystem-backed job store rooted at `<home>/jobs`.
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(home: &Path) -> Self {
        Self {
            root: home.join("jobs"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self, id: &str) -> JobPaths {
        JobPaths::new(self.root.join(id))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.paths(id).state.exists()
    }

    /// Job ids with a record on disk, sorted.
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read {}", self.root.display())),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("read {}", self.root.display()))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if entry.path().join("state.json").exists() {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn create_dir(&self, id: &str) -> Result<JobPaths> {
        let paths = self.paths(id);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create job dir {}", paths.dir.display()))?;
        Ok(paths)
    }

    pub fn write_contract(&self, contract: &RuntimeContract) -> Result<()> {
        write_json_atomic(&self.paths(&contract.id).meta, contract)
    }

    pub fn load_contract(&self, id: &str) -> Result<RuntimeContract> {
        read_json(&self.paths(id).meta)
    }

    pub fn write_record(&self, record: &JobRecord) -> Result<()> {
        debug!(job_id = %record.id, state = %record.state, "writing job record");
        write_json_atomic(&self.paths(&record.id).state, record)
    }

    pub fn load_record(&self, id: &str) -> Result<JobRecord> {
        read_json(&self.paths(id).state)
    }

    pub fn write_prompt(&self, id: &str, prompt: &str) -> Result<PathBuf> {
        let path = self.paths(id).prompt;
        write_atomic(&path, prompt)?;
        Ok(path)
    }

    pub fn write_pid(&self, id: &str, pid: u32) -> Result<()> {
        write_atomic(&self.paths(id).pid, &format!("{pid}\n"))
    }

    pub fn read_pid(&self, id: &str) -> Result<Option<u32>> {
        read_number(&self.paths(id).pid)
    }

    pub fn write_monitor_pid(&self, id: &str, pid: u32) -> Result<()> {
        write_atomic(&self.paths(id).monitor_pid, &format!("{pid}\n"))
    }

    pub fn read_monitor_pid(&self, id: &str) -> Result<Option<u32>> {
        read_number(&self.paths(id).monitor_pid)
    }

    pub fn clear_monitor_pid(&self, id: &str) -> Result<()> {
        remove_if_exists(&self.paths(id).monitor_pid)
    }

    pub fn write_heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        write_atomic(&self.paths(id).heartbeat, &format!("{}\n", at.to_rfc3339()))
    }

    pub fn read_heartbeat(&self, id: &str) -> Result<Option<DateTime<Utc>>> {
        let path = self.paths(id).heartbeat;
        let Some(raw) = read_optional(&path)? else {
            return Ok(None);
        };
        let at = DateTime::parse_from_rfc3339(raw.trim())
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(at.with_timezone(&Utc)))
    }

    pub fn write_mutations(&self, id: &str, count: u64) -> Result<()> {
        write_atomic(&self.paths(id).mutations, &format!("{count}\n"))
    }

    pub fn read_mutations(&self, id: &str) -> Result<u64> {
        Ok(read_number(&self.paths(id).mutations)?.unwrap_or(0))
    }

    /// Exit status captured by the launch wrapper, if the agent has exited.
    pub fn read_exit_code(&self, id: &str) -> Result<Option<i32>> {
        read_number(&self.paths(id).exit_code)
    }

    pub fn clear_exit_code(&self, id: &str) -> Result<()> {
        remove_if_exists(&self.paths(id).exit_code)
    }

    /// Move `job.log` to the next free `job.log.N`. Never truncates or overwrites.
    pub fn rotate_log(&self, id: &str) -> Result<Option<PathBuf>> {
        let paths = self.paths(id);
        if !paths.log.exists() {
            return Ok(None);
        }
        let mut n = 1;
        while paths.rotated_log(n).exists() {
            n += 1;
        }
        let target = paths.rotated_log(n);
        fs::rename(&paths.log, &target).with_context(|| {
            format!("rotate {} -> {}", paths.log.display(), target.display())
        })?;
        info!(job_id = id, rotated = %target.display(), "log rotated");
        Ok(Some(target))
    }

    /// Number of rotated logs on disk.
    pub fn rotated_log_count(&self, id: &str) -> u32 {
        let paths = self.paths(id);
        let mut n = 0;
        while paths.rotated_log(n + 1).exists() {
            n += 1;
        }
        n
    }

    /// Append the attempt header so a log is never empty, even if the agent prints nothing.
    pub fn append_log_header(&self, id: &str, attempt: u32, model: &str, at: DateTime<Utc>) -> Result<()> {
        use std::io::Write;
        let path = self.paths(id).log;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        writeln!(
            file,
            "{LOG_HEADER_PREFIX}{id} attempt {attempt} model {model} at {} ===",
            at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
        .with_context(|| format!("write {}", path.display()))
    }

    /// Current log size and modification time, when the log exists.
    pub fn log_stats(&self, id: &str) -> (Option<u64>, Option<i64>) {
        let path = self.paths(id).log;
        let len = fs::metadata(&path).ok().map(|m| m.len());
        (len, crate::io::fsutil::modified_ms(&path))
    }

    /// Last `max_bytes` of the current log (lossy UTF-8).
    pub fn log_tail(&self, id: &str, max_bytes: usize) -> Result<String> {
        let path = self.paths(id).log;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(String::new()),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        let start = bytes.len().saturating_sub(max_bytes);
        Ok(String::from_utf8_lossy(&bytes[start..]).to_string())
    }

    pub fn load_outcome(&self, id: &str) -> Result<Option<Outcome>> {
        let path = self.paths(id).outcome;
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Write the outcome exactly once. If one already exists, it is returned
    /// unchanged and `outcome` is discarded.
    ///
    /// The record is written to a temp file and hard-linked into place, so a
    /// reader never sees a partial outcome and a racing writer loses cleanly.
    pub fn write_outcome_once(&self, outcome: &Outcome) -> Result<Outcome> {
        let paths = self.paths(&outcome.id);
        let tmp = temp_sibling(&paths.dir, "outcome.json");
        let mut buf = serde_json::to_string_pretty(outcome).context("serialize outcome")?;
        buf.push('\n');
        fs::write(&tmp, buf).with_context(|| format!("write {}", tmp.display()))?;
        let linked = fs::hard_link(&tmp, &paths.outcome);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {
                info!(job_id = %outcome.id, state = %outcome.state, "outcome recorded");
                Ok(outcome.clone())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                debug!(job_id = %outcome.id, "outcome already recorded");
                self.load_outcome(&outcome.id)?
                    .ok_or_else(|| anyhow!("outcome for {} vanished", outcome.id))
            }
            Err(err) => {
                Err(err).with_context(|| format!("write {}", paths.outcome.display()))
            }
        }
    }

    /// Delete every artifact of a job.
    pub fn remove_job(&self, id: &str) -> Result<()> {
        let dir = self.paths(id).dir;
        fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
        info!(job_id = id, "job artifacts removed");
        Ok(())
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

fn read_number<T: std::str::FromStr>(path: &Path) -> Result<Option<T>> {
    let Some(raw) = read_optional(path)? else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|_| anyhow!("parse {}: '{trimmed}'", path.display()))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}
