//! Worktree discovery and live inspection.
//!
//! Discovery is anchored to the scratch-root convention
//! `<scratch_root>/<repo>/<name>/` with a `.git` entry at exactly that depth.
//! It never walks further down, so vendored checkouts or virtualenvs that
//! carry their own `.git` are never mistaken for fleet worktrees.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::core::closure::WorktreeFacts;
use crate::io::git::Git;

/// A discovered fleet worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeRef {
    pub repo: String,
    pub name: String,
    pub path: PathBuf,
}

/// Discover worktrees under `scratch_root`. A missing root yields nothing.
pub fn discover(scratch_root: &Path) -> Result<Vec<WorktreeRef>> {
    let mut found = Vec::new();
    for (repo, repo_dir) in visible_subdirs(scratch_root)? {
        for (name, path) in visible_subdirs(&repo_dir)? {
            if path.join(".git").exists() {
                found.push(WorktreeRef {
                    repo: repo.clone(),
                    name,
                    path,
                });
            } else {
                debug!(path = %path.display(), "skipping directory without .git");
            }
        }
    }
    found.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(found)
}

fn visible_subdirs(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            out.push((name, entry.path()));
        }
    }
    Ok(out)
}

/// Knobs for one inspection pass.
#[derive(Debug, Clone)]
pub struct InspectOptions {
    pub remote: String,
    pub trunk: String,
    pub session_marker: String,
    pub session_fresh_for: Duration,
    pub now: SystemTime,
}

impl InspectOptions {
    pub fn trunk_ref(&self) -> String {
        format!("{}/{}", self.remote, self.trunk)
    }
}

/// Live facts plus the context needed to act on them.
#[derive(Debug, Clone, Serialize)]
pub struct Inspection {
    pub worktree: WorktreeRef,
    pub branch: Option<String>,
    pub upstream: Option<String>,
    pub dirty_paths: usize,
    pub facts: WorktreeFacts,
    pub age_hours: u64,
}

/// Compute [`WorktreeFacts`] from live git state. Read-only: no fetch.
#[instrument(skip_all, fields(worktree = %worktree.path.display()))]
pub fn inspect(worktree: &WorktreeRef, opts: &InspectOptions) -> Result<Inspection> {
    let git = Git::new(&worktree.path);
    let trunk_ref = opts.trunk_ref();
    if !git.rev_exists(&trunk_ref)? {
        return Err(anyhow!(
            "trunk ref {trunk_ref} not found in {}",
            worktree.path.display()
        ));
    }

    let branch = git.current_branch()?;
    let upstream = git.upstream()?;
    let dirty = git.dirty_entries_except(&[opts.session_marker.as_str()])?;
    let commits_ahead = git.count_ahead(&trunk_ref, "HEAD")?;
    let unpushed = match &upstream {
        Some(upstream) => git.count_ahead(upstream, "HEAD")?,
        None => commits_ahead,
    };
    let is_merged_to_trunk = git.is_ancestor("HEAD", &trunk_ref)?;

    let head_time = git.head_commit_time()?;
    let reflog_time = modified_secs(&git.git_dir()?.join("logs").join("HEAD"));
    let last_activity = reflog_time.map_or(head_time, |t| t.max(head_time));
    let age = age_since(opts.now, last_activity);

    let marker = worktree.path.join(&opts.session_marker);
    let has_active_lock = is_fresh(&marker, opts.now, opts.session_fresh_for);

    let facts = WorktreeFacts {
        has_upstream: upstream.is_some(),
        is_dirty: !dirty.is_empty(),
        is_merged_to_trunk,
        commits_ahead,
        unpushed,
        age,
        has_active_lock,
    };
    debug!(?facts, "inspected worktree");
    Ok(Inspection {
        worktree: worktree.clone(),
        branch,
        upstream,
        dirty_paths: dirty.len(),
        facts,
        age_hours: age.as_secs() / 3600,
    })
}

/// Whether `marker` exists and was touched within `fresh_for` of `now`.
pub fn is_fresh(marker: &Path, now: SystemTime, fresh_for: Duration) -> bool {
    let Ok(modified) = fs::metadata(marker).and_then(|m| m.modified()) else {
        return false;
    };
    match now.duration_since(modified) {
        Ok(elapsed) => elapsed <= fresh_for,
        // Touched "in the future" relative to `now`: treat as fresh.
        Err(_) => true,
    }
}

fn modified_secs(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let secs = modified.duration_since(SystemTime::UNIX_EPOCH).ok()?.as_secs();
    i64::try_from(secs).ok()
}

fn age_since(now: SystemTime, epoch_secs: i64) -> Duration {
    let now_secs = now
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let then = u64::try_from(epoch_secs).unwrap_or(0);
    Duration::from_secs(now_secs.saturating_sub(then))
}
