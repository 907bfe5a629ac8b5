//! Stable exit codes for fleet CLI commands.

/// Command succeeded, or `check` found a healthy or succeeded job.
pub const OK: i32 = 0;
/// Invalid arguments, config or job id, or any unclassified error.
pub const INVALID: i32 = 1;
/// `fleet check` observed a stalled job.
pub const STALLED: i32 = 2;
/// `fleet check` observed a dead process or a failed/aborted job.
pub const FAILED: i32 = 3;
/// Provider credentials or model unavailable; nothing was created.
pub const PREFLIGHT: i32 = 4;
/// Worktree outside the scratch root.
pub const PERMISSION: i32 = 5;
/// Restart refused at the retry ceiling.
pub const RETRY_EXHAUSTED: i32 = 6;
/// A push failed; no destructive step was taken.
pub const PUSH_FAILURE: i32 = 7;
/// A lock or active-session marker was held; operation skipped.
pub const LOCK_CONTENTION: i32 = 8;
/// `sweep`/`guard` completed but produced actionable exceptions.
pub const EXCEPTIONS: i32 = 9;
