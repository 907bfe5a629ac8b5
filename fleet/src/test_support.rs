//! Test-only helpers: git fixtures with a bare remote, command-provider
//! configs, and a recording review-request fake.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::io::config::{FleetConfig, ProviderConfig, ProviderKind};
use crate::io::review::{DraftRequest, ReviewRef, ReviewRequests};

/// Name of the command provider installed by [`command_config`].
pub const TEST_PROVIDER: &str = "stub";

/// Run git in `dir`, returning trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .with_context(|| format!("run git {}", args.join(" ")))?;
    if !out.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// A bare `remote.git` with one commit on `main`, a fleet home with a scratch
/// root, and helpers to clone canonical copies and add scratch worktrees.
pub struct TestRepo {
    temp: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let root = temp.path();
        fs::create_dir_all(root.join("home/worktrees")).context("create scratch root")?;

        git(root, &["init", "--quiet", "--bare", "-b", "main", "remote.git"])?;
        let seed = root.join("seed");
        git(root, &["init", "--quiet", "-b", "main", "seed"])?;
        configure_identity(&seed)?;
        fs::write(seed.join("README.md"), "fleet test repo\n").context("write README")?;
        git(&seed, &["add", "README.md"])?;
        git(&seed, &["commit", "--quiet", "-m", "initial"])?;
        let remote = root.join("remote.git");
        git(&seed, &["remote", "add", "origin", &remote.to_string_lossy()])?;
        git(&seed, &["push", "--quiet", "origin", "main"])?;
        Ok(Self { temp })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Fleet home (`<tmp>/home`).
    pub fn home(&self) -> PathBuf {
        self.path().join("home")
    }

    /// Default scratch root under the home.
    pub fn scratch_root(&self) -> PathBuf {
        self.home().join("worktrees")
    }

    pub fn remote(&self) -> PathBuf {
        self.path().join("remote.git")
    }

    /// Clone the remote to `<tmp>/canonical/<name>`.
    pub fn clone_canonical(&self, name: &str) -> Result<PathBuf> {
        let parent = self.path().join("canonical");
        fs::create_dir_all(&parent).context("create canonical dir")?;
        let remote = self.remote();
        git(&parent, &["clone", "--quiet", &remote.to_string_lossy(), name])?;
        let path = parent.join(name);
        configure_identity(&path)?;
        Ok(path)
    }

    /// Add a linked worktree at `<scratch>/<repo>/<name>` on a new branch
    /// `name` from `origin/main`, without upstream tracking.
    pub fn add_worktree(&self, canonical: &Path, repo: &str, name: &str) -> Result<PathBuf> {
        let path = self.scratch_root().join(repo).join(name);
        fs::create_dir_all(path.parent().context("worktree parent")?)
            .context("create repo dir")?;
        git(
            canonical,
            &[
                "worktree",
                "add",
                "--quiet",
                "--no-track",
                "-b",
                name,
                &path.to_string_lossy(),
                "origin/main",
            ],
        )?;
        Ok(path)
    }

    /// Make the remote reject every push (fetch keeps working).
    pub fn reject_pushes(&self) -> Result<()> {
        let hook = self.remote().join("hooks/pre-receive");
        fs::write(&hook, "#!/bin/sh\necho 'push rejected by test hook' >&2\nexit 1\n")
            .context("write pre-receive hook")?;
        make_executable(&hook)
    }

    pub fn remote_branches(&self) -> Result<Vec<String>> {
        let out = git(&self.remote(), &["for-each-ref", "--format=%(refname:short)", "refs/heads"])?;
        Ok(out.lines().map(str::to_string).collect())
    }
}

/// Write `contents` to `dir/name` and commit it.
pub fn commit_file(dir: &Path, name: &str, contents: &str, message: &str) -> Result<()> {
    fs::write(dir.join(name), contents).with_context(|| format!("write {name}"))?;
    git(dir, &["add", name])?;
    git(dir, &["commit", "--quiet", "-m", message])?;
    Ok(())
}

fn configure_identity(repo: &Path) -> Result<()> {
    git(repo, &["config", "user.name", "Fleet Test"])?;
    git(repo, &["config", "user.email", "fleet-test@example.com"])?;
    git(repo, &["config", "commit.gpgsign", "false"])?;
    Ok(())
}

fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).with_context(|| format!("chmod {}", path.display()))
}

/// Config with only a `stub` command provider running `command`
/// (model `stub`, no credential), and fast job timings.
pub fn command_config(command: &[&str]) -> FleetConfig {
    let mut providers = BTreeMap::new();
    providers.insert(
        TEST_PROVIDER.to_string(),
        ProviderConfig {
            kind: ProviderKind::Command,
            command: command.iter().map(|s| s.to_string()).collect(),
            models: vec!["stub".to_string()],
            aliases: BTreeMap::new(),
            default_model: Some("stub".to_string()),
            credential_env: None,
        },
    );
    let mut config = FleetConfig {
        providers,
        ..FleetConfig::default()
    };
    config.jobs.poll_interval_secs = 1;
    config.jobs.backoff_base_secs = 1;
    config.jobs.backoff_max_secs = 1;
    config.jobs.stop_grace_secs = 2;
    config.guardian.host = Some("test-host".to_string());
    config
}

/// Poll `predicate` every 20ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    predicate()
}

/// Everything the fake hosting service has seen.
#[derive(Debug, Clone, Default)]
pub struct ReviewLog {
    pub open: Vec<ReviewRef>,
    pub created: Vec<DraftRequest>,
    pub updated: Vec<(u64, String)>,
    pub closed: Vec<u64>,
}

/// In-memory [`ReviewRequests`] that records every call.
#[derive(Debug, Default)]
pub struct RecordingReviews {
    log: Mutex<ReviewLog>,
}

impl RecordingReviews {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a request is already open.
    pub fn seed_open(&self, number: u64, title: &str, head: &str) {
        self.lock().open.push(ReviewRef {
            number,
            title: title.to_string(),
            head: head.to_string(),
        });
    }

    pub fn log(&self) -> ReviewLog {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReviewLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ReviewRequests for RecordingReviews {
    fn find_open_by_head(&self, _repo: &Path, head: &str) -> Result<Vec<ReviewRef>> {
        Ok(self.lock().open.iter().filter(|r| r.head == head).cloned().collect())
    }

    fn find_open_by_title(&self, _repo: &Path, title: &str) -> Result<Option<ReviewRef>> {
        Ok(self.lock().open.iter().find(|r| r.title == title).cloned())
    }

    fn list_open_with_head_prefix(&self, _repo: &Path, prefix: &str) -> Result<Vec<ReviewRef>> {
        Ok(self
            .lock()
            .open
            .iter()
            .filter(|r| r.head.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn create_draft(&self, _repo: &Path, request: &DraftRequest) -> Result<ReviewRef> {
        let mut log = self.lock();
        let number = 100 + log.created.len() as u64 + log.open.len() as u64;
        let review = ReviewRef {
            number,
            title: request.title.clone(),
            head: request.head.clone(),
        };
        log.created.push(request.clone());
        log.open.push(review.clone());
        Ok(review)
    }

    fn update_body(&self, _repo: &Path, number: u64, body: &str) -> Result<()> {
        self.lock().updated.push((number, body.to_string()));
        Ok(())
    }

    fn close(&self, _repo: &Path, number: u64, _comment: &str) -> Result<()> {
        let mut log = self.lock();
        log.open.retain(|r| r.number != number);
        log.closed.push(number);
        Ok(())
    }
}
