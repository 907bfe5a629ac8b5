//! Closure policy: map a worktree's live git facts to a disposition bucket.
//!
//! The decision tree is evaluated top to bottom; the first matching rule wins.
//!
//! 1. fresh session marker                         -> keep (active)
//! 2. clean, merged, no upstream                   -> safe-delete
//! 3. clean, merged, upstream, past cooldown       -> safe-delete
//! 4. clean, merged, upstream, within cooldown     -> keep (cooling down)
//! 5. unmerged with unpushed commits               -> must-surface
//! 6. dirty, zero commits ahead of trunk           -> dirty-no-commits
//! 7. dirty, unmerged, past staleness              -> escalate
//! 8. anything else                                -> keep

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Live facts about one worktree, recomputed on every sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeFacts {
    pub has_upstream: bool,
    pub is_dirty: bool,
    pub is_merged_to_trunk: bool,
    /// Commits on HEAD that trunk does not contain.
    pub commits_ahead: u32,
    /// Commits not yet on the remote (vs upstream, or vs trunk without one).
    pub unpushed: u32,
    pub age: Duration,
    pub has_active_lock: bool,
}

/// Time thresholds and switches for the decision tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosurePolicy {
    pub cooldown: Duration,
    pub staleness: Duration,
    /// Execute safe deletes as archive-then-delete.
    pub archive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Disposition {
    SafeDelete,
    Archive,
    MustSurface,
    DirtyNoCommits,
    Escalate,
    Keep,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SafeDelete => "SAFE_DELETE",
            Self::Archive => "ARCHIVE",
            Self::MustSurface => "MUST_SURFACE",
            Self::DirtyNoCommits => "DIRTY_NO_COMMITS",
            Self::Escalate => "ESCALATE",
            Self::Keep => "KEEP",
        }
    }

    /// Whether executing this disposition removes the worktree.
    pub fn removes_worktree(self) -> bool {
        matches!(self, Self::SafeDelete | Self::Archive)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A disposition plus the rule that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub disposition: Disposition,
    pub rule: &'static str,
}

/// Classify a worktree. Pure: the same facts always give the same decision.
pub fn classify(facts: &WorktreeFacts, policy: &ClosurePolicy) -> Decision {
    let decide = |disposition, rule| Decision { disposition, rule };
    let clean_merged = !facts.is_dirty && facts.is_merged_to_trunk;

    if facts.has_active_lock {
        return decide(Disposition::Keep, "active-session");
    }
    if clean_merged && !facts.has_upstream {
        return decide(delete_disposition(policy), "merged-local-branch");
    }
    if clean_merged && facts.age >= policy.cooldown {
        return decide(delete_disposition(policy), "merged-past-cooldown");
    }
    if clean_merged {
        return decide(Disposition::Keep, "merged-cooling-down");
    }
    if !facts.is_merged_to_trunk && facts.unpushed > 0 {
        return decide(Disposition::MustSurface, "unpushed-commits");
    }
    if facts.is_dirty && facts.commits_ahead == 0 {
        return decide(Disposition::DirtyNoCommits, "dirty-without-commits");
    }
    if facts.is_dirty && !facts.is_merged_to_trunk && facts.age >= policy.staleness {
        return decide(Disposition::Escalate, "stale-dirty-work");
    }
    decide(Disposition::Keep, "in-progress")
}

fn delete_disposition(policy: &ClosurePolicy) -> Disposition {
    if policy.archive {
        Disposition::Archive
    } else {
        Disposition::SafeDelete
    }
}
