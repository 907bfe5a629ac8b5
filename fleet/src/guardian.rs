//! Canonical clone guardian: rescue-then-reset.
//!
//! A dirty or off-trunk canonical clone is snapshotted into a rescue commit,
//! pushed to `<prefix>/<host>/<repo>/<timestamp>`, recorded in the single
//! rolling rescue request for the host+repo pair, and only then reset to the
//! remote trunk. If the push fails the clone is left exactly as it was.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::summary::{Summary, SummaryItem};
use crate::error::FleetError;
use crate::io::config::FleetConfig;
use crate::io::git::Git;
use crate::io::inventory::is_fresh;
use crate::io::lock::Locks;
use crate::io::review::{DraftRequest, ReviewBodies, ReviewRequests, rescue_title};

/// Paths under the git dir that mean another git operation is mid-flight.
const GIT_OPERATION_MARKERS: &[&str] = &["index.lock", "HEAD.lock", "rebase-merge", "rebase-apply"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "request")]
pub enum RescueRequest {
    Created { number: u64 },
    Updated { number: u64 },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum GuardAction {
    /// Clean and on trunk.
    Clean,
    /// Locked or in active use; not touched.
    Skipped { reason: String },
    /// `--dry-run`: would be rescued.
    Planned { dirty_paths: usize, branch: Option<String> },
    Rescued { branch: String, request: RescueRequest },
    /// Push failed; the clone was left untouched.
    PushFailed { branch: String, message: String },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardEntry {
    pub repo: String,
    pub path: PathBuf,
    pub action: GuardAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum CleanupAction {
    Closed,
    /// `--dry-run`: would be closed.
    Planned,
    Failed { message: String },
}

/// A rescue request the controller acted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupEntry {
    pub repo: String,
    pub number: u64,
    pub head: String,
    pub action: CleanupAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardReport {
    pub dry_run: bool,
    pub controller: bool,
    pub entries: Vec<GuardEntry>,
    pub cleanup: Vec<CleanupEntry>,
    pub summary: Summary,
}

impl GuardReport {
    pub fn push_failed(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e.action, GuardAction::PushFailed { .. }))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GuardOptions {
    pub dry_run: bool,
    pub now: SystemTime,
}

pub struct Guardian<'a> {
    home: PathBuf,
    config: &'a FleetConfig,
    locks: Locks,
    reviews: &'a dyn ReviewRequests,
    bodies: ReviewBodies,
}

impl<'a> Guardian<'a> {
    pub fn new(home: &Path, config: &'a FleetConfig, reviews: &'a dyn ReviewRequests) -> Result<Self> {
        Ok(Self {
            home: home.to_path_buf(),
            config,
            locks: Locks::new(home),
            reviews,
            bodies: ReviewBodies::new()?,
        })
    }

    fn canonical_paths(&self) -> Vec<PathBuf> {
        self.config
            .guardian
            .canonical
            .iter()
            .map(|p| if p.is_absolute() { p.clone() } else { self.home.join(p) })
            .collect()
    }

    /// Guard every configured canonical clone, then (controller only) close
    /// rescue requests whose work already landed on trunk.
    #[instrument(skip_all, fields(dry_run = options.dry_run))]
    pub fn guard(&self, options: GuardOptions) -> Result<GuardReport> {
        let mut summary = Summary::new(if options.dry_run { "guard (dry run)" } else { "guard" });
        let mut entries = Vec::new();
        for path in self.canonical_paths() {
            let repo = repo_name(&path);
            let action = match self.guard_one(&path, &repo, options) {
                Ok(action) => action,
                Err(err) => failure_action(err),
            };
            let entry = GuardEntry { repo, path, action };
            record(&mut summary, &entry);
            entries.push(entry);
        }

        let controller = self.config.guardian.controller;
        let cleanup = if controller {
            self.close_landed_rescues(options.dry_run)
        } else {
            info!("not the controller host; skipping rescue request cleanup");
            Vec::new()
        };
        for item in &cleanup {
            match &item.action {
                CleanupAction::Closed => summary.count("rescue-closed"),
                CleanupAction::Planned => summary.count("rescue-closable"),
                CleanupAction::Failed { message } => summary.push(SummaryItem::new(
                    "cleanup-failed",
                    format!("{}#{}", item.repo, item.number),
                    message.clone(),
                )),
            }
        }

        Ok(GuardReport {
            dry_run: options.dry_run,
            controller,
            entries,
            cleanup,
            summary,
        })
    }

    #[instrument(skip_all, fields(clone = %path.display()))]
    fn guard_one(&self, path: &Path, repo: &str, options: GuardOptions) -> Result<GuardAction> {
        let _lock = self.locks.lock_worktree(path)?;
        let git = Git::new(path);
        let closure = &self.config.closure;

        let git_dir = git.git_dir()?;
        if let Some(marker) = GIT_OPERATION_MARKERS
            .iter()
            .find(|name| git_dir.join(name).exists())
        {
            return Err(FleetError::LockContention {
                what: format!("{} ({marker})", path.display()),
            }
            .into());
        }
        let session = path.join(&closure.session_marker);
        if is_fresh(&session, options.now, self.config.session_fresh_for()) {
            return Err(FleetError::LockContention {
                what: format!("{} (active session)", path.display()),
            }
            .into());
        }

        git.fetch(&closure.remote, self.config.network_timeout())
            .context("fetch")?;
        let trunk_ref = format!("{}/{}", closure.remote, closure.trunk);
        let branch = git.current_branch()?;
        let dirty = git.dirty_entries_except(&[closure.session_marker.as_str()])?;
        let unpushed = git.count_ahead(&trunk_ref, "HEAD")?;
        let on_trunk = branch.as_deref() == Some(closure.trunk.as_str());
        if dirty.is_empty() && on_trunk && unpushed == 0 {
            debug!("canonical clone is clean");
            return Ok(GuardAction::Clean);
        }
        info!(
            dirty = dirty.len(),
            branch = ?branch,
            unpushed,
            "canonical clone needs rescue"
        );
        if options.dry_run {
            return Ok(GuardAction::Planned {
                dirty_paths: dirty.len(),
                branch,
            });
        }

        let host = self.config.host();
        let stamp = DateTime::<Utc>::from(options.now).format("%Y%m%d_%H%M%S");
        let prefix = self.config.rescue_prefix();
        let rescue_branch = format!("{prefix}/{host}/{repo}/{stamp}");

        let commit = if dirty.is_empty() {
            git.rev_parse("HEAD")?
        } else {
            git.snapshot_commit(&format!("fleet rescue: {host}/{repo} at {stamp}"))?
        };
        if let Err(err) = git.push(
            &closure.remote,
            &commit,
            &format!("refs/heads/{rescue_branch}"),
            false,
            self.config.network_timeout(),
        ) {
            return Err(FleetError::PushFailure {
                branch: rescue_branch,
                message: format!("{err:#}"),
            }
            .into());
        }
        info!(branch = %rescue_branch, commit = %commit, "rescue pushed");

        // Durable from here on.
        let request = match self.upsert_rescue_request(&git, repo, &host, &rescue_branch) {
            Ok(request) => request,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "rescue request not updated");
                RescueRequest::Failed {
                    message: format!("{err:#}"),
                }
            }
        };

        git.reset_hard("HEAD")?;
        git.clean_untracked()?;
        git.checkout(&closure.trunk)?;
        git.reset_hard(&trunk_ref)?;
        info!(trunk = %trunk_ref, "canonical clone reset");
        Ok(GuardAction::Rescued {
            branch: rescue_branch,
            request,
        })
    }

    /// Create the rolling rescue request, or refresh its branch list.
    fn upsert_rescue_request(
        &self,
        git: &Git,
        repo: &str,
        host: &str,
        rescue_branch: &str,
    ) -> Result<RescueRequest> {
        let closure = &self.config.closure;
        if let Err(err) = git.fetch(&closure.remote, self.config.network_timeout()) {
            warn!(err = %format!("{err:#}"), "refresh after push failed");
        }
        let prefix = format!("{}/{host}/{repo}/", self.config.rescue_prefix());
        let mut branches = git.remote_branches(&closure.remote, &prefix)?;
        if !branches.iter().any(|b| b == rescue_branch) {
            branches.push(rescue_branch.to_string());
        }
        branches.sort();

        let body = self
            .bodies
            .rescue(repo, host, &closure.remote, &closure.trunk, &branches)?;
        let title = rescue_title(host, repo);
        let workdir = git.workdir();
        if let Some(existing) = self.reviews.find_open_by_title(workdir, &title)? {
            self.reviews.update_body(workdir, existing.number, &body)?;
            return Ok(RescueRequest::Updated {
                number: existing.number,
            });
        }
        let created = self.reviews.create_draft(
            workdir,
            &DraftRequest {
                head: rescue_branch.to_string(),
                base: closure.trunk.clone(),
                title,
                body,
            },
        )?;
        Ok(RescueRequest::Created {
            number: created.number,
        })
    }

    /// Controller only: close open rescue requests (from any host) whose head
    /// branch is already contained in the remote trunk.
    fn close_landed_rescues(&self, dry_run: bool) -> Vec<CleanupEntry> {
        let closure = &self.config.closure;
        let trunk_ref = format!("{}/{}", closure.remote, closure.trunk);
        let prefix = format!("{}/", self.config.rescue_prefix());
        let mut out = Vec::new();
        for path in self.canonical_paths() {
            let repo = repo_name(&path);
            let git = Git::new(&path);
            let open = match self.reviews.list_open_with_head_prefix(&path, &prefix) {
                Ok(open) => open,
                Err(err) => {
                    warn!(repo = %repo, err = %format!("{err:#}"), "cannot list rescue requests");
                    continue;
                }
            };
            for request in open {
                let head_ref = format!("{}/{}", closure.remote, request.head);
                let landed = git.rev_exists(&head_ref).and_then(|exists| {
                    if exists {
                        git.is_ancestor(&head_ref, &trunk_ref)
                    } else {
                        Ok(false)
                    }
                });
                let action = match landed {
                    Ok(false) => continue,
                    Ok(true) if dry_run => CleanupAction::Planned,
                    Ok(true) => match self.reviews.close(
                        &path,
                        request.number,
                        &format!("Rescued work from `{}` is contained in `{trunk_ref}`.", request.head),
                    ) {
                        Ok(()) => CleanupAction::Closed,
                        Err(err) => CleanupAction::Failed {
                            message: format!("{err:#}"),
                        },
                    },
                    Err(err) => CleanupAction::Failed {
                        message: format!("{err:#}"),
                    },
                };
                out.push(CleanupEntry {
                    repo: repo.clone(),
                    number: request.number,
                    head: request.head,
                    action,
                });
            }
        }
        out
    }
}

fn repo_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn failure_action(err: anyhow::Error) -> GuardAction {
    match err.downcast_ref::<FleetError>() {
        Some(FleetError::LockContention { what }) => GuardAction::Skipped {
            reason: format!("{what} is locked"),
        },
        Some(FleetError::PushFailure { branch, message }) => GuardAction::PushFailed {
            branch: branch.clone(),
            message: message.clone(),
        },
        _ => GuardAction::Failed {
            message: format!("{err:#}"),
        },
    }
}

fn record(summary: &mut Summary, entry: &GuardEntry) {
    let subject = entry.repo.clone();
    match &entry.action {
        GuardAction::Clean => summary.count("clean"),
        GuardAction::Skipped { .. } => summary.count("skipped"),
        GuardAction::Planned { .. } => summary.count("needs-rescue"),
        GuardAction::Rescued { branch, request } => {
            summary.count("rescued");
            if let RescueRequest::Failed { message } = request {
                summary.push(SummaryItem::new(
                    "request-failed",
                    subject,
                    format!("{branch}: {message}"),
                ));
            }
        }
        GuardAction::PushFailed { branch, message } => summary.push(SummaryItem::new(
            "push-failed",
            subject,
            format!("{branch}: {message}"),
        )),
        GuardAction::Failed { message } => {
            summary.push(SummaryItem::new("failed", subject, message.clone()));
        }
    }
}
