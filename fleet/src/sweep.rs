//! Worktree closure: read-only inventory and the acting sweep.
//!
//! Both share one inspection path. The sweep fetches first, then inspects and
//! classifies from live git state under a per-worktree lock, so two sweeps
//! racing on the same directory delete it at most once.
//!
//! A worktree that a fleet job without a recorded outcome runs in is kept
//! (rule `active-job`) ahead of the closure decision tree.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::core::budget::ReviewBudget;
use crate::core::closure::{Decision, Disposition, classify};
use crate::core::summary::{Summary, SummaryItem};
use crate::io::config::FleetConfig;
use crate::io::git::Git;
use crate::io::inventory::{InspectOptions, Inspection, WorktreeRef, discover, inspect};
use crate::io::job_store::JobStore;
use crate::io::lock::Locks;
use crate::io::review::{DraftRequest, ReviewBodies, ReviewRequests, SurfaceContext};

/// One worktree as seen by `inventory`.
#[derive(Debug, Clone, Serialize)]
pub struct InventoryEntry {
    pub worktree: WorktreeRef,
    pub inspection: Option<Inspection>,
    pub disposition: Option<Disposition>,
    pub rule: Option<&'static str>,
    pub error: Option<String>,
}

/// What happened to a surfaced branch's review request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "review")]
pub enum ReviewStatus {
    Created { number: u64 },
    Existing { number: u64 },
    /// Budget exhausted; a later sweep opens it.
    Deferred,
    Failed { message: String },
}

/// Per-worktree sweep result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum SweepAction {
    Deleted,
    Archived { bundle: PathBuf },
    Pushed { branch: String, review: ReviewStatus },
    Reported,
    Kept,
    /// `--dry-run`: the disposition was computed but nothing was done.
    Planned,
    /// Another sweep removed the worktree first.
    Absent,
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepEntry {
    pub worktree: WorktreeRef,
    pub disposition: Option<Disposition>,
    pub rule: Option<&'static str>,
    pub action: SweepAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub dry_run: bool,
    pub entries: Vec<SweepEntry>,
    pub summary: Summary,
}

#[derive(Debug, Clone, Copy)]
pub struct SweepOptions {
    pub dry_run: bool,
    /// Reference time for ages and marker freshness.
    pub now: SystemTime,
}

pub struct Sweeper<'a> {
    home: PathBuf,
    config: &'a FleetConfig,
    locks: Locks,
    reviews: &'a dyn ReviewRequests,
    bodies: ReviewBodies,
}

impl<'a> Sweeper<'a> {
    pub fn new(home: &Path, config: &'a FleetConfig, reviews: &'a dyn ReviewRequests) -> Result<Self> {
        Ok(Self {
            home: home.to_path_buf(),
            config,
            locks: Locks::new(home),
            reviews,
            bodies: ReviewBodies::new()?,
        })
    }

    fn inspect_options(&self, now: SystemTime) -> InspectOptions {
        InspectOptions {
            remote: self.config.closure.remote.clone(),
            trunk: self.config.closure.trunk.clone(),
            session_marker: self.config.closure.session_marker.clone(),
            session_fresh_for: self.config.session_fresh_for(),
            now,
        }
    }

    /// Canonical worktrees of jobs that have no outcome yet.
    fn active_job_worktrees(&self) -> Result<HashSet<PathBuf>> {
        let store = JobStore::new(&self.home);
        let mut active = HashSet::new();
        for id in store.list_ids()? {
            if store.load_outcome(&id)?.is_some() {
                continue;
            }
            match store.load_contract(&id) {
                Ok(contract) => {
                    active.insert(canonical(&contract.worktree));
                }
                Err(err) => warn!(job_id = %id, err = %format!("{err:#}"), "unreadable job contract"),
            }
        }
        Ok(active)
    }

    fn decide(&self, inspection: &Inspection, active_jobs: &HashSet<PathBuf>) -> Decision {
        if active_jobs.contains(&canonical(&inspection.worktree.path)) {
            return Decision {
                disposition: Disposition::Keep,
                rule: "active-job",
            };
        }
        classify(&inspection.facts, &self.config.closure_policy())
    }

    /// Classify every discovered worktree without fetching or acting.
    pub fn inventory(&self, now: SystemTime) -> Result<Vec<InventoryEntry>> {
        let opts = self.inspect_options(now);
        let active_jobs = self.active_job_worktrees()?;
        let worktrees = discover(&self.config.scratch_root(&self.home))?;
        Ok(worktrees
            .into_iter()
            .map(|worktree| match inspect(&worktree, &opts) {
                Ok(inspection) => {
                    let decision = self.decide(&inspection, &active_jobs);
                    InventoryEntry {
                        worktree,
                        inspection: Some(inspection),
                        disposition: Some(decision.disposition),
                        rule: Some(decision.rule),
                        error: None,
                    }
                }
                Err(err) => InventoryEntry {
                    worktree,
                    inspection: None,
                    disposition: None,
                    rule: None,
                    error: Some(format!("{err:#}")),
                },
            })
            .collect())
    }

    /// Fetch, classify and act on every discovered worktree.
    #[instrument(skip_all, fields(dry_run = options.dry_run))]
    pub fn sweep(&self, options: SweepOptions) -> Result<SweepReport> {
        let worktrees = discover(&self.config.scratch_root(&self.home))?;
        let active_jobs = self.active_job_worktrees()?;
        let mut budget = ReviewBudget::new(self.config.closure.review_budget);
        let mut summary = Summary::new(if options.dry_run { "sweep (dry run)" } else { "sweep" });
        let mut entries = Vec::with_capacity(worktrees.len());

        for worktree in worktrees {
            let entry = match self.sweep_one(&worktree, options, &active_jobs, &mut budget) {
                Ok(entry) => entry,
                Err(err) => SweepEntry {
                    worktree: worktree.clone(),
                    disposition: None,
                    rule: None,
                    action: SweepAction::Failed {
                        message: format!("{err:#}"),
                    },
                },
            };
            record(&mut summary, &entry);
            entries.push(entry);
        }
        info!(
            worktrees = entries.len(),
            exceptions = summary.exceptions.len(),
            "sweep finished"
        );
        Ok(SweepReport {
            dry_run: options.dry_run,
            entries,
            summary,
        })
    }

    #[instrument(skip_all, fields(worktree = %worktree.path.display()))]
    fn sweep_one(
        &self,
        worktree: &WorktreeRef,
        options: SweepOptions,
        active_jobs: &HashSet<PathBuf>,
        budget: &mut ReviewBudget,
    ) -> Result<SweepEntry> {
        let _lock = self.locks.lock_worktree(&worktree.path)?;
        let entry = |disposition: Option<Disposition>,
                     rule: Option<&'static str>,
                     action: SweepAction| SweepEntry {
            worktree: worktree.clone(),
            disposition,
            rule,
            action,
        };
        if !worktree.path.join(".git").exists() {
            debug!("worktree already removed");
            return Ok(entry(None, None, SweepAction::Absent));
        }

        let git = Git::new(&worktree.path);
        git.fetch(&self.config.closure.remote, self.config.network_timeout())
            .context("fetch")?;
        let inspection = inspect(worktree, &self.inspect_options(options.now))?;
        let decision = self.decide(&inspection, active_jobs);
        let (disposition, rule) = (Some(decision.disposition), Some(decision.rule));
        debug!(disposition = %decision.disposition, rule = decision.rule, "classified");

        if options.dry_run {
            return Ok(entry(disposition, rule, SweepAction::Planned));
        }
        let action = match decision.disposition {
            Disposition::SafeDelete => {
                remove_worktree(worktree, inspection.branch.as_deref())?;
                SweepAction::Deleted
            }
            Disposition::Archive => {
                let bundle = self.archive(worktree, options.now)?;
                remove_worktree(worktree, inspection.branch.as_deref())?;
                SweepAction::Archived { bundle }
            }
            Disposition::MustSurface => self.surface(&git, &inspection, budget),
            Disposition::Escalate | Disposition::DirtyNoCommits => SweepAction::Reported,
            Disposition::Keep => SweepAction::Kept,
        };
        Ok(entry(disposition, rule, action))
    }

    /// Push the branch, then open a draft request if none is open and the
    /// budget allows. A failed push stops here.
    fn surface(&self, git: &Git, inspection: &Inspection, budget: &mut ReviewBudget) -> SweepAction {
        let Some(branch) = inspection.branch.clone() else {
            return SweepAction::Failed {
                message: "detached HEAD; nothing to push".to_string(),
            };
        };
        let closure = &self.config.closure;
        let local_ref = format!("refs/heads/{branch}");
        if let Err(err) = git.push(
            &closure.remote,
            &local_ref,
            &local_ref,
            true,
            self.config.network_timeout(),
        ) {
            warn!(branch = %branch, err = %format!("{err:#}"), "push failed");
            return SweepAction::Failed {
                message: format!("push {branch}: {err:#}"),
            };
        }
        info!(branch = %branch, "branch pushed");

        let review = match self.open_review(git.workdir(), &branch, inspection, budget) {
            Ok(review) => review,
            Err(err) => {
                warn!(branch = %branch, err = %format!("{err:#}"), "review request failed");
                ReviewStatus::Failed {
                    message: format!("{err:#}"),
                }
            }
        };
        SweepAction::Pushed { branch, review }
    }

    fn open_review(
        &self,
        repo: &Path,
        branch: &str,
        inspection: &Inspection,
        budget: &mut ReviewBudget,
    ) -> Result<ReviewStatus> {
        if let Some(existing) = self.reviews.find_open_by_head(repo, branch)?.first() {
            return Ok(ReviewStatus::Existing {
                number: existing.number,
            });
        }
        if !budget.try_take() {
            debug!(branch, "review budget exhausted");
            return Ok(ReviewStatus::Deferred);
        }
        let host = self.config.host();
        let worktree = inspection.worktree.path.to_string_lossy();
        let body = self.bodies.surface(&SurfaceContext {
            repo: &inspection.worktree.repo,
            branch,
            worktree: &worktree,
            trunk: &self.config.closure.trunk,
            commits_ahead: inspection.facts.commits_ahead,
            dirty: inspection.facts.is_dirty,
            host: &host,
        })?;
        let created = self.reviews.create_draft(
            repo,
            &DraftRequest {
                head: branch.to_string(),
                base: self.config.closure.trunk.clone(),
                title: format!("[fleet] {}: {branch}", inspection.worktree.repo),
                body,
            },
        )?;
        Ok(ReviewStatus::Created {
            number: created.number,
        })
    }

    /// Copy the worktree to `<archive_dir>/<repo>/<name>-<YYYYmmdd_HHMMSS>/`.
    fn archive(&self, worktree: &WorktreeRef, now: SystemTime) -> Result<PathBuf> {
        let stamp = DateTime::<Utc>::from(now).format("%Y%m%d_%H%M%S");
        let parent = self
            .config
            .archive_dir(&self.home)
            .join(&worktree.repo);
        let mut bundle = parent.join(format!("{}-{stamp}", worktree.name));
        let mut n = 1;
        while bundle.exists() {
            bundle = parent.join(format!("{}-{stamp}-{n}", worktree.name));
            n += 1;
        }
        copy_tree(&worktree.path, &bundle)?;
        info!(bundle = %bundle.display(), "worktree archived");
        Ok(bundle)
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Remove a worktree. Linked worktrees (`.git` is a file) are removed through
/// their owning repository and their merged branch is deleted with `branch -d`;
/// standalone clones are removed from disk.
fn remove_worktree(worktree: &WorktreeRef, branch: Option<&str>) -> Result<()> {
    let dot_git = worktree.path.join(".git");
    if dot_git.is_file() {
        let common = Git::new(&worktree.path).common_dir()?;
        let owner = common
            .parent()
            .ok_or_else(|| anyhow!("no owning repository for {}", common.display()))?;
        let owner = Git::new(owner);
        owner.worktree_remove(&worktree.path)?;
        if let Some(branch) = branch {
            owner.delete_merged_branch(branch)?;
        }
    } else {
        fs::remove_dir_all(&worktree.path)
            .with_context(|| format!("remove {}", worktree.path.display()))?;
    }
    info!(worktree = %worktree.path.display(), "worktree removed");
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("create {}", target.display()))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("read link {}", entry.path().display()))?;
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("link {}", target.display()))?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

fn record(summary: &mut Summary, entry: &SweepEntry) {
    let subject = format!("{}/{}", entry.worktree.repo, entry.worktree.name);
    match &entry.action {
        SweepAction::Deleted => summary.count("deleted"),
        SweepAction::Archived { .. } => summary.count("archived"),
        SweepAction::Pushed { branch, review } => {
            summary.count("surfaced");
            match review {
                ReviewStatus::Deferred => summary.count("review-deferred"),
                ReviewStatus::Failed { message } => summary.push(SummaryItem::new(
                    "review-failed",
                    subject,
                    format!("{branch}: {message}"),
                )),
                ReviewStatus::Created { .. } | ReviewStatus::Existing { .. } => {}
            }
        }
        SweepAction::Reported => {
            let (category, detail) = match entry.disposition {
                Some(Disposition::Escalate) => ("escalate", "dirty, unmerged and stale"),
                _ => ("dirty-no-commits", "uncommitted changes with no commits ahead"),
            };
            summary.push(SummaryItem::new(category, subject, detail));
        }
        SweepAction::Kept => summary.count("kept"),
        SweepAction::Planned => {
            if let Some(disposition) = entry.disposition {
                summary.count(disposition.as_str().to_ascii_lowercase());
            }
        }
        SweepAction::Absent => summary.count("absent"),
        SweepAction::Failed { message } => {
            summary.push(SummaryItem::new("failed", subject, message.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wt(name: &str) -> WorktreeRef {
        WorktreeRef {
            repo: "app".to_string(),
            name: name.to_string(),
            path: PathBuf::from(format!("/scratch/app/{name}")),
        }
    }

    #[test]
    fn copy_tree_preserves_nested_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("a/b")).expect("mkdir");
        fs::write(src.join("a/b/c.txt"), "payload").expect("write");
        fs::write(src.join(".git"), "gitdir: /x\n").expect("write");
        let dst = temp.path().join("dst");
        copy_tree(&src, &dst).expect("copy");
        assert_eq!(fs::read_to_string(dst.join("a/b/c.txt")).expect("read"), "payload");
        assert!(dst.join(".git").is_file());
    }

    #[test]
    fn summary_reports_escalations_and_counts_quiet_work() {
        let mut summary = Summary::new("sweep");
        record(
            &mut summary,
            &SweepEntry {
                worktree: wt("a"),
                disposition: Some(Disposition::SafeDelete),
                rule: Some("merged-local-branch"),
                action: SweepAction::Deleted,
            },
        );
        record(
            &mut summary,
            &SweepEntry {
                worktree: wt("b"),
                disposition: Some(Disposition::Escalate),
                rule: Some("stale-dirty"),
                action: SweepAction::Reported,
            },
        );
        assert_eq!(summary.counts.get("deleted"), Some(&1));
        assert_eq!(summary.exceptions.len(), 1);
        assert_eq!(summary.exceptions[0].category, "escalate");
        assert_eq!(summary.exceptions[0].subject, "app/b");
    }

    #[test]
    fn deferred_review_is_counted_not_escalated() {
        let mut summary = Summary::new("sweep");
        record(
            &mut summary,
            &SweepEntry {
                worktree: wt("c"),
                disposition: Some(Disposition::MustSurface),
                rule: Some("unpushed-commits"),
                action: SweepAction::Pushed {
                    branch: "feature/c".to_string(),
                    review: ReviewStatus::Deferred,
                },
            },
        );
        assert!(summary.is_all_clear());
        assert_eq!(summary.counts.get("review-deferred"), Some(&1));
    }
}
