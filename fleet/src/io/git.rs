//! Git adapter for fleet commands.
//!
//! Closure decisions must be recomputed from live git state, so every query
//! shells out to `git` through this small wrapper. Network operations (fetch,
//! push) run under a timeout and never prompt for credentials.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::run_command_with_timeout;

const NETWORK_OUTPUT_LIMIT: usize = 64 * 1024;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Current branch name, or `None` on detached HEAD.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            return Ok(None);
        }
        Ok(Some(name))
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", "--quiet", rev])?;
        Ok(out.trim().to_string())
    }

    /// Whether `rev` resolves to a commit.
    pub fn rev_exists(&self, rev: &str) -> Result<bool> {
        let spec = format!("{rev}^{{commit}}");
        let status = self
            .run(&["rev-parse", "--verify", "--quiet", &spec])?
            .status;
        Ok(status.success())
    }

    /// Absolute path of this checkout's git dir (`.git` or `.git/worktrees/<name>`).
    pub fn git_dir(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--path-format=absolute", "--git-dir"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Absolute path of the shared git dir; differs from `git_dir` for linked worktrees.
    pub fn common_dir(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--path-format=absolute", "--git-common-dir"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Status entries excluding paths equal to or under any of `ignored`.
    pub fn dirty_entries_except(&self, ignored: &[&str]) -> Result<Vec<StatusEntry>> {
        let entries = self.status_porcelain()?;
        Ok(entries
            .into_iter()
            .filter(|entry| {
                !ignored.iter().any(|name| {
                    entry.path == *name || entry.path.starts_with(&format!("{name}/"))
                })
            })
            .collect())
    }

    /// Upstream tracking ref (e.g. `origin/feature`), if configured.
    pub fn upstream(&self) -> Result<Option<String>> {
        let out = self.run(&[
            "rev-parse",
            "--abbrev-ref",
            "--symbolic-full-name",
            "@{u}",
        ])?;
        if !out.status.success() {
            return Ok(None);
        }
        let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
        Ok((!name.is_empty()).then_some(name))
    }

    /// Number of commits reachable from `head` but not from `base`.
    pub fn count_ahead(&self, base: &str, head: &str) -> Result<u32> {
        let range = format!("{base}..{head}");
        let out = self.run_capture(&["rev-list", "--count", &range])?;
        out.trim()
            .parse()
            .with_context(|| format!("parse rev-list count '{}'", out.trim()))
    }

    /// `git merge-base --is-ancestor`: exit 0 is true, exit 1 is false.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let out = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git merge-base --is-ancestor {ancestor} {descendant} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )),
        }
    }

    /// Committer time of HEAD, in seconds since the epoch.
    pub fn head_commit_time(&self) -> Result<i64> {
        let out = self.run_capture(&["log", "-1", "--format=%ct", "HEAD"])?;
        out.trim()
            .parse()
            .with_context(|| format!("parse commit time '{}'", out.trim()))
    }

    #[instrument(skip_all, fields(remote))]
    pub fn fetch(&self, remote: &str, timeout: Duration) -> Result<()> {
        debug!(remote, "fetching");
        self.run_network(&["fetch", "--prune", "--quiet", remote], timeout)
    }

    /// Push `src` to `remote` as `dst_ref`. Fails on any non-zero exit or timeout.
    #[instrument(skip_all, fields(remote, dst_ref))]
    pub fn push(
        &self,
        remote: &str,
        src: &str,
        dst_ref: &str,
        set_upstream: bool,
        timeout: Duration,
    ) -> Result<()> {
        let refspec = format!("{src}:{dst_ref}");
        let mut args = vec!["push", "--porcelain"];
        if set_upstream {
            args.push("-u");
        }
        args.push(remote);
        args.push(&refspec);
        debug!(refspec = %refspec, "pushing");
        self.run_network(&args, timeout)
    }

    /// Remote branch names under `prefix` (without the `<remote>/` part).
    pub fn remote_branches(&self, remote: &str, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("refs/remotes/{remote}/{prefix}");
        let out = self.run_capture(&["for-each-ref", "--format=%(refname)", &pattern])?;
        let strip = format!("refs/remotes/{remote}/");
        Ok(out
            .lines()
            .filter_map(|line| line.trim().strip_prefix(&strip).map(str::to_string))
            .collect())
    }

    /// Snapshot the full working tree (tracked + untracked, honoring .gitignore)
    /// as a commit whose parent is HEAD. HEAD, the index and the files are untouched.
    #[instrument(skip_all)]
    pub fn snapshot_commit(&self, message: &str) -> Result<String> {
        let index_path = self
            .git_dir()?
            .join(format!("fleet-rescue-index-{}", std::process::id()));
        let result = self.snapshot_with_index(index_path.as_os_str(), message);
        if let Err(err) = std::fs::remove_file(&index_path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(err = %err, path = %index_path.display(), "failed to remove temp index");
        }
        result
    }

    fn snapshot_with_index(&self, index: &OsStr, message: &str) -> Result<String> {
        let env = [("GIT_INDEX_FILE", index)];
        self.run_checked_env(&["read-tree", "HEAD"], &env)?;
        self.run_checked_env(&["add", "-A"], &env)?;
        let tree = self.run_checked_env(&["write-tree"], &env)?;
        let tree = String::from_utf8_lossy(&tree.stdout).trim().to_string();
        let commit = self.run_checked(&["commit-tree", &tree, "-p", "HEAD", "-m", message])?;
        Ok(String::from_utf8_lossy(&commit.stdout).trim().to_string())
    }

    #[instrument(skip_all, fields(rev))]
    pub fn checkout(&self, rev: &str) -> Result<()> {
        debug!(rev, "checking out");
        self.run_checked(&["checkout", "--quiet", rev])?;
        Ok(())
    }

    #[instrument(skip_all, fields(rev))]
    pub fn reset_hard(&self, rev: &str) -> Result<()> {
        self.run_checked(&["reset", "--hard", "--quiet", rev])?;
        Ok(())
    }

    /// Remove untracked files and directories (ignored files are kept).
    pub fn clean_untracked(&self) -> Result<()> {
        self.run_checked(&["clean", "-fd", "--quiet"])?;
        Ok(())
    }

    /// `git worktree remove --force <path>`, run from this (owning) repository.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.run_checked(&["worktree", "remove", "--force", &path])?;
        Ok(())
    }

    /// Non-forcing `git branch -d`. Returns false if git refused.
    pub fn delete_merged_branch(&self, branch: &str) -> Result<bool> {
        let out = self.run(&["branch", "-d", branch])?;
        if !out.status.success() {
            warn!(
                branch,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "branch not deleted"
            );
        }
        Ok(out.status.success())
    }

    /// Run an arbitrary git command and fail on non-zero exit.
    pub fn run_checked(&self, args: &[&str]) -> Result<Output> {
        self.run_checked_env(args, &[])
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked_env(&self, args: &[&str], envs: &[(&str, &OsStr)]) -> Result<Output> {
        let output = self
            .command(args, envs)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        self.command(args, &[])
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }

    fn run_network(&self, args: &[&str], timeout: Duration) -> Result<()> {
        let mut cmd = self.command(args, &[]);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        let output = run_command_with_timeout(cmd, None, timeout, NETWORK_OUTPUT_LIMIT)
            .with_context(|| format!("run git {}", args.join(" ")))?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {}s",
                args.join(" "),
                timeout.as_secs()
            ));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(())
    }

    fn command(&self, args: &[&str], envs: &[(&str, &OsStr)]) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("GIT_OPTIONAL_LOCKS", "0");
        for (key, value) in envs {
            cmd.env(key, value);
        }
        cmd
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once(" -> ") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry {
        code,
        path: unquote(&path),
    })
}

fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}
