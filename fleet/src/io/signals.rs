//! Progress-signal sampling for running jobs.

use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::core::health::Sample;
use crate::io::fsutil::modified_ms;
use crate::io::job_store::JobStore;
use crate::io::process::group_cpu_ticks;

/// Hash of every file's relative path, size and mtime under `root`, skipping
/// directories named in `ignore`. `None` if the worktree cannot be read.
///
/// Content is not read; a rewrite that keeps size and mtime is invisible,
/// which is acceptable for a liveness signal.
pub fn worktree_fingerprint(root: &Path, ignore: &[String]) -> Option<String> {
    if !root.is_dir() {
        return None;
    }
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && ignore.iter().any(|name| e.file_name() == name.as_str()))
        });
    let mut hasher = Sha256::new();
    let mut files = 0usize;
    for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(meta.len().to_le_bytes());
        hasher.update(modified_ms(entry.path()).unwrap_or(0).to_le_bytes());
        files += 1;
    }
    debug!(root = %root.display(), files, "worktree fingerprinted");
    Some(hex::encode(hasher.finalize()))
}

/// Read every available signal for one job.
///
/// `mutation_count` is the counter after folding in the latest fingerprint;
/// it is `None` when the worktree could not be fingerprinted.
pub fn collect_sample(
    store: &JobStore,
    id: &str,
    pgid: Option<u32>,
    mutation_count: Option<u64>,
) -> Sample {
    let (log_bytes, log_modified_ms) = store.log_stats(id);
    Sample {
        log_bytes,
        log_modified_ms,
        cpu_ticks: pgid.and_then(group_cpu_ticks),
        mutation_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn fingerprint_changes_when_files_change() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join("a.txt"), "one").expect("write");
        let ignore = vec![".git".to_string(), "target".to_string()];
        let first = worktree_fingerprint(root, &ignore).expect("fingerprint");
        assert_eq!(
            worktree_fingerprint(root, &ignore).expect("again"),
            first
        );
        fs::write(root.join("b.txt"), "two").expect("write");
        assert_ne!(worktree_fingerprint(root, &ignore).expect("changed"), first);
    }

    #[test]
    fn fingerprint_ignores_configured_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join("a.txt"), "one").expect("write");
        let ignore = vec!["target".to_string()];
        let before = worktree_fingerprint(root, &ignore).expect("fingerprint");
        fs::create_dir_all(root.join("target/debug")).expect("mkdir");
        fs::write(root.join("target/debug/out.o"), "bin").expect("write");
        assert_eq!(worktree_fingerprint(root, &ignore).expect("after"), before);
    }

    #[test]
    fn missing_worktree_has_no_fingerprint() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(worktree_fingerprint(&temp.path().join("gone"), &[]).is_none());
    }
}
