//! Closure sweeps over real linked worktrees backed by a bare remote.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use fleet::core::closure::Disposition;
use fleet::io::config::FleetConfig;
use fleet::io::provider::EnvCredentials;
use fleet::orchestrator::{Orchestrator, StartRequest};
use fleet::sweep::{ReviewStatus, SweepAction, SweepEntry, SweepOptions, SweepReport, Sweeper};
use fleet::test_support::{RecordingReviews, TEST_PROVIDER, TestRepo, command_config, commit_file, git};

const HOUR: Duration = Duration::from_secs(3600);

struct Fixture {
    repo: TestRepo,
    canonical: PathBuf,
    config: FleetConfig,
    reviews: RecordingReviews,
}

impl Fixture {
    fn new() -> Self {
        let repo = TestRepo::new().expect("repo");
        let canonical = repo.clone_canonical("app").expect("clone");
        Self {
            repo,
            canonical,
            config: command_config(&["true"]),
            reviews: RecordingReviews::new(),
        }
    }

    fn worktree(&self, name: &str) -> PathBuf {
        self.repo
            .add_worktree(&self.canonical, "app", name)
            .expect("worktree")
    }

    fn sweep_at(&self, now: SystemTime, dry_run: bool) -> SweepReport {
        Sweeper::new(&self.repo.home(), &self.config, &self.reviews)
            .expect("sweeper")
            .sweep(SweepOptions { dry_run, now })
            .expect("sweep")
    }

    fn sweep(&self) -> SweepReport {
        self.sweep_at(SystemTime::now(), false)
    }

    fn local_branches(&self) -> Vec<String> {
        git(
            &self.canonical,
            &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
        )
        .expect("branches")
        .lines()
        .map(str::to_string)
        .collect()
    }
}

fn entry<'a>(report: &'a SweepReport, name: &str) -> &'a SweepEntry {
    report
        .entries
        .iter()
        .find(|e| e.worktree.name == name)
        .unwrap_or_else(|| panic!("no entry for {name}: {report:?}"))
}

/// Two commits plus an untracked file: unpushed work with a dirty tree.
fn unpushed_work(path: &Path) {
    commit_file(path, "a.txt", "one\n", "first change").expect("commit");
    commit_file(path, "b.txt", "two\n", "second change").expect("commit");
    fs::write(path.join("scratch.txt"), "notes\n").expect("untracked");
}

/// Verifies a clean merged worktree is deleted along with its local branch.
#[test]
fn merged_clean_worktree_is_deleted() {
    let fx = Fixture::new();
    let w1 = fx.worktree("W1");
    assert!(fx.local_branches().contains(&"W1".to_string()));

    let report = fx.sweep_at(SystemTime::now() + 30 * HOUR, false);
    let w = entry(&report, "W1");
    assert_eq!(w.disposition, Some(Disposition::SafeDelete));
    assert_eq!(w.action, SweepAction::Deleted);
    assert!(!w1.exists());
    assert!(!fx.local_branches().contains(&"W1".to_string()));
    assert_eq!(report.summary.counts.get("deleted"), Some(&1));
    assert!(report.summary.exceptions.is_empty());
}

/// Verifies unpushed commits are pushed and get exactly one review request,
/// and a later push of the same branch reuses it.
#[test]
fn unpushed_commits_are_surfaced_once() {
    let fx = Fixture::new();
    let w2 = fx.worktree("W2");
    unpushed_work(&w2);

    let first = fx.sweep();
    let w = entry(&first, "W2");
    assert_eq!(w.disposition, Some(Disposition::MustSurface));
    assert_eq!(
        w.action,
        SweepAction::Pushed {
            branch: "W2".to_string(),
            review: ReviewStatus::Created { number: 100 },
        }
    );
    assert!(w2.exists());
    assert!(fx.repo.remote_branches().expect("remote").contains(&"W2".to_string()));
    let upstream = git(&w2, &["rev-parse", "--abbrev-ref", "@{upstream}"]).expect("upstream");
    assert_eq!(upstream, "origin/W2");

    let second = fx.sweep();
    assert_eq!(entry(&second, "W2").action, SweepAction::Kept);

    commit_file(&w2, "c.txt", "three\n", "third change").expect("commit");
    let third = fx.sweep();
    assert!(matches!(
        &entry(&third, "W2").action,
        SweepAction::Pushed {
            review: ReviewStatus::Existing { number: 100 },
            ..
        }
    ));

    let log = fx.reviews.log();
    assert_eq!(log.created.len(), 1);
    assert_eq!(log.created[0].head, "W2");
    assert_eq!(log.created[0].base, "main");
    assert_eq!(log.created[0].title, "[fleet] app: W2");
}

/// Verifies an exhausted review budget still pushes but defers the request.
#[test]
fn exhausted_budget_defers_the_request() {
    let mut fx = Fixture::new();
    fx.config.closure.review_budget = 0;
    let w2 = fx.worktree("W2");
    unpushed_work(&w2);

    let report = fx.sweep();
    assert_eq!(
        entry(&report, "W2").action,
        SweepAction::Pushed {
            branch: "W2".to_string(),
            review: ReviewStatus::Deferred,
        }
    );
    assert!(fx.repo.remote_branches().expect("remote").contains(&"W2".to_string()));
    assert!(fx.reviews.log().created.is_empty());
    assert_eq!(report.summary.counts.get("review-deferred"), Some(&1));
}

/// Verifies a failed push surfaces as a failure and leaves the worktree alone.
#[test]
fn rejected_push_is_reported() {
    let fx = Fixture::new();
    let w2 = fx.worktree("W2");
    unpushed_work(&w2);
    fx.repo.reject_pushes().expect("hook");

    let report = fx.sweep();
    assert!(matches!(entry(&report, "W2").action, SweepAction::Failed { .. }));
    assert!(w2.join("scratch.txt").exists());
    assert!(fx.reviews.log().created.is_empty());
    assert_eq!(report.summary.exceptions[0].category, "failed");
}

/// Verifies pushed but still dirty work is escalated once it goes stale.
#[test]
fn stale_dirty_work_is_escalated() {
    let fx = Fixture::new();
    let w2 = fx.worktree("W2");
    unpushed_work(&w2);
    fx.sweep();

    let report = fx.sweep_at(SystemTime::now() + 100 * HOUR, false);
    let w = entry(&report, "W2");
    assert_eq!(w.disposition, Some(Disposition::Escalate));
    assert_eq!(w.action, SweepAction::Reported);
    assert!(w2.exists());
    assert_eq!(report.summary.exceptions.len(), 1);
    assert_eq!(report.summary.exceptions[0].category, "escalate");
}

/// Verifies uncommitted changes with nothing ahead of trunk are reported, not touched.
#[test]
fn dirty_without_commits_is_reported() {
    let fx = Fixture::new();
    let w3 = fx.worktree("W3");
    fs::write(w3.join("README.md"), "edited\n").expect("edit");

    let report = fx.sweep();
    let w = entry(&report, "W3");
    assert_eq!(w.disposition, Some(Disposition::DirtyNoCommits));
    assert_eq!(w.action, SweepAction::Reported);
    assert_eq!(fs::read_to_string(w3.join("README.md")).expect("read"), "edited\n");
}

/// Verifies a fresh session marker protects an otherwise deletable worktree.
#[test]
fn fresh_session_marker_keeps_the_worktree() {
    let fx = Fixture::new();
    let w1 = fx.worktree("W1");
    fs::write(w1.join(".fleet-session"), "pid 4242\n").expect("marker");

    let report = fx.sweep();
    let w = entry(&report, "W1");
    assert_eq!(w.disposition, Some(Disposition::Keep));
    assert_eq!(w.rule, Some("active-session"));
    assert_eq!(w.action, SweepAction::Kept);
    assert!(w1.exists());
}

/// Verifies a dry run classifies everything and changes nothing.
#[test]
fn dry_run_changes_nothing() {
    let fx = Fixture::new();
    let w1 = fx.worktree("W1");
    let w2 = fx.worktree("W2");
    unpushed_work(&w2);

    let report = fx.sweep_at(SystemTime::now(), true);
    assert!(report.dry_run);
    assert!(report.entries.iter().all(|e| e.action == SweepAction::Planned));
    assert_eq!(entry(&report, "W1").disposition, Some(Disposition::SafeDelete));
    assert_eq!(entry(&report, "W2").disposition, Some(Disposition::MustSurface));
    assert!(w1.exists());
    assert!(!fx.repo.remote_branches().expect("remote").contains(&"W2".to_string()));
    assert!(fx.reviews.log().created.is_empty());
    assert_eq!(report.summary.counts.get("safe_delete"), Some(&1));
}

/// Verifies inventory classifies without fetching, pushing or deleting.
#[test]
fn inventory_is_read_only() {
    let fx = Fixture::new();
    let w1 = fx.worktree("W1");
    let w2 = fx.worktree("W2");
    unpushed_work(&w2);

    let sweeper = Sweeper::new(&fx.repo.home(), &fx.config, &fx.reviews).expect("sweeper");
    let entries = sweeper.inventory(SystemTime::now()).expect("inventory");
    assert_eq!(entries.len(), 2);
    let w2_entry = entries.iter().find(|e| e.worktree.name == "W2").expect("W2");
    assert_eq!(w2_entry.disposition, Some(Disposition::MustSurface));
    let inspection = w2_entry.inspection.as_ref().expect("inspection");
    assert_eq!(inspection.facts.commits_ahead, 2);
    assert_eq!(inspection.dirty_paths, 1);

    assert!(w1.exists());
    assert!(!fx.repo.remote_branches().expect("remote").contains(&"W2".to_string()));
    assert!(fx.reviews.log().created.is_empty());
}

/// Verifies two sweeps racing on one directory delete it exactly once.
#[test]
fn concurrent_sweeps_delete_once() {
    let fx = Fixture::new();
    let w1 = fx.worktree("W1");

    let reports: Vec<SweepReport> = thread::scope(|scope| {
        let handles: Vec<_> = (0..2).map(|_| scope.spawn(|| fx.sweep())).collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect()
    });

    let actions: Vec<&SweepAction> = reports
        .iter()
        .flat_map(|r| r.entries.iter().map(|e| &e.action))
        .collect();
    let deleted = actions.iter().filter(|a| ***a == SweepAction::Deleted).count();
    assert_eq!(deleted, 1, "actions: {actions:?}");
    assert!(
        actions
            .iter()
            .all(|a| matches!(a, SweepAction::Deleted | SweepAction::Absent)),
        "actions: {actions:?}"
    );
    assert!(!w1.exists());
}

/// Verifies archive mode copies the worktree aside before removing it.
#[test]
fn archive_mode_keeps_a_copy() {
    let mut fx = Fixture::new();
    fx.config.closure.archive = true;
    let w1 = fx.worktree("W1");

    let report = fx.sweep();
    let w = entry(&report, "W1");
    assert_eq!(w.disposition, Some(Disposition::Archive));
    let SweepAction::Archived { bundle } = &w.action else {
        panic!("expected archive, got {:?}", w.action);
    };
    assert!(bundle.starts_with(fx.repo.home().join("archive").join("app")));
    assert_eq!(
        fs::read_to_string(bundle.join("README.md")).expect("archived README"),
        "fleet test repo\n"
    );
    assert!(!w1.exists());
    assert_eq!(report.summary.counts.get("archived"), Some(&1));
}

/// Verifies a clean merged worktree that a running job uses is kept, and is
/// deleted once the job has an outcome.
#[test]
fn running_job_keeps_its_worktree() {
    let fx = Fixture::new();
    let w = fx.worktree("J1");
    let orch = Orchestrator::new(
        &fx.repo.home(),
        command_config(&["sleep", "30"]),
        Arc::new(EnvCredentials),
    );
    orch.start(&StartRequest {
        id: "J1".to_string(),
        provider: TEST_PROVIDER.to_string(),
        prompt: "tidy the docs".to_string(),
        worktree: w.clone(),
        model: None,
    })
    .expect("start");

    let later = SystemTime::now() + 30 * HOUR;
    let inventory = Sweeper::new(&fx.repo.home(), &fx.config, &fx.reviews)
        .expect("sweeper")
        .inventory(later)
        .expect("inventory");
    assert_eq!(inventory[0].rule, Some("active-job"));

    let report = fx.sweep_at(later, false);
    let kept = entry(&report, "J1");
    assert_eq!(kept.disposition, Some(Disposition::Keep));
    assert_eq!(kept.rule, Some("active-job"));
    assert_eq!(kept.action, SweepAction::Kept);
    assert!(w.exists());

    orch.stop("J1").expect("stop");
    let report = fx.sweep_at(later, false);
    assert_eq!(entry(&report, "J1").action, SweepAction::Deleted);
    assert!(!w.exists());
}
