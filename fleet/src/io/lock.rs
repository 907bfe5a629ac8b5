//! Advisory file locks serializing per-job, per-worktree and singleton work.
//!
//! Locks live under `<home>/locks/` so that taking one never creates job or
//! worktree artifacts. The lock is released when the guard is dropped.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::FleetError;

/// Held exclusive lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Lock file paths for one fleet home.
#[derive(Debug, Clone)]
pub struct Locks {
    dir: PathBuf,
}

impl Locks {
    pub fn new(home: &Path) -> Self {
        Self {
            dir: home.join("locks"),
        }
    }

    pub fn job_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("job-{id}.lock"))
    }

    /// Worktree locks are keyed by a hash of the path so any path maps to a safe file name.
    pub fn worktree_path(&self, worktree: &Path) -> PathBuf {
        let digest = Sha256::digest(worktree.to_string_lossy().as_bytes());
        self.dir
            .join(format!("worktree-{}.lock", &hex::encode(digest)[..16]))
    }

    pub fn singleton_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.lock"))
    }

    /// Block until the job lock is held.
    pub fn lock_job(&self, id: &str) -> Result<LockGuard> {
        acquire(&self.job_path(id))
    }

    pub fn lock_worktree(&self, worktree: &Path) -> Result<LockGuard> {
        acquire(&self.worktree_path(worktree))
    }

    /// Take a fleet-wide singleton lock or fail with `LockContention`.
    pub fn try_lock_singleton(&self, name: &str) -> Result<LockGuard> {
        let path = self.singleton_path(name);
        try_acquire(&path)?.ok_or_else(|| {
            FleetError::LockContention {
                what: format!("{name} ({})", path.display()),
            }
            .into()
        })
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create lock dir {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open lock {}", path.display()))
}

/// Block until an exclusive lock on `path` is held.
pub fn acquire(path: &Path) -> Result<LockGuard> {
    let file = open_lock_file(path)?;
    file.lock_exclusive()
        .with_context(|| format!("acquire lock {}", path.display()))?;
    debug!(path = %path.display(), "lock acquired");
    Ok(LockGuard {
        file,
        path: path.to_path_buf(),
    })
}

/// Take the lock if free; `Ok(None)` if another holder has it.
/// The holder's pid is written into the file for diagnostics.
pub fn try_acquire(path: &Path) -> Result<Option<LockGuard>> {
    let mut file = open_lock_file(path)?;
    if file.try_lock_exclusive().is_err() {
        debug!(path = %path.display(), "lock busy");
        return Ok(None);
    }
    file.set_len(0)
        .with_context(|| format!("truncate lock {}", path.display()))?;
    writeln!(file, "{}", std::process::id())
        .with_context(|| format!("write lock {}", path.display()))?;
    Ok(Some(LockGuard {
        file,
        path: path.to_path_buf(),
    }))
}
